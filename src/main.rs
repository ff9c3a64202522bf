// src/main.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eframe::egui;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pose_overlay::app::PoseOverlayApp;
use pose_overlay::classifier::{ClassificationBridge, RemoteModelLoader};
use pose_overlay::config::AppConfig;
use pose_overlay::detector::SimulatedDetectorFactory;
use pose_overlay::render::PixmapSurface;
use pose_overlay::tracking::PoseTracker;
use pose_overlay::video;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = AppConfig::load()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pose-overlay")
        .build()
        .context("failed to start async runtime")?;
    let cancel = CancellationToken::new();

    let (frame_tx, frame_rx) = watch::channel(None);
    let video_config = config.video.clone();
    let capture = video::spawn_capture(
        move || video::open_source(&video_config),
        frame_tx,
        cancel.clone(),
    )
    .context("failed to start capture thread")?;

    let surface = PixmapSurface::new(config.video.width, config.video.height)
        .context("overlay size must be non-zero")?;
    let bridge = match &config.classifier {
        Some(classifier) => ClassificationBridge::new(
            Arc::new(RemoteModelLoader::new()),
            classifier.options.clone(),
            classifier.source.clone(),
        ),
        None => ClassificationBridge::disabled(),
    };
    let (tracker, overlay_rx) = PoseTracker::new(
        config.tracker.clone(),
        config.detector.clone(),
        Arc::new(SimulatedDetectorFactory),
        frame_rx.clone(),
        surface,
        bridge,
    );
    let tracking = runtime.spawn(tracker.run(cancel.clone()));

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 800.0])
            .with_min_inner_size([640.0, 400.0]),
        centered: true,
        ..Default::default()
    };
    let mirror_preview = config.tracker.style.mirrored;
    let app_cancel = cancel.clone();
    let result = eframe::run_native(
        "Pose Overlay",
        options,
        Box::new(move |cc| {
            cc.egui_ctx.set_visuals(create_visuals());
            Box::new(PoseOverlayApp::new(cc, frame_rx, overlay_rx, app_cancel, mirror_preview))
        }),
    );

    cancel.cancel();
    if let Err(e) = runtime.block_on(tracking) {
        warn!("tracking task ended abnormally: {}", e);
    }
    runtime.shutdown_timeout(Duration::from_secs(2));
    if capture.join().is_err() {
        warn!("capture thread panicked");
    }
    info!("shut down");

    result.map_err(|e| anyhow::anyhow!("window failed: {}", e))
}

fn create_visuals() -> egui::Visuals {
    let mut visuals = egui::Visuals::dark();

    visuals.widgets.noninteractive.bg_fill = egui::Color32::from_rgb(30, 30, 35);
    visuals.widgets.inactive.bg_fill = egui::Color32::from_rgb(45, 45, 52);
    visuals.widgets.hovered.bg_fill = egui::Color32::from_rgb(55, 55, 65);
    visuals.widgets.active.bg_fill = egui::Color32::from_rgb(70, 130, 240);

    visuals.widgets.noninteractive.rounding = egui::Rounding::same(8.0);
    visuals.widgets.inactive.rounding = egui::Rounding::same(8.0);
    visuals.window_rounding = egui::Rounding::same(12.0);

    visuals
}
