// src/app.rs
use std::time::Duration;

use eframe::egui;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::tracking::{OverlayFrame, TrackerStatus};
use crate::video::FrameReceiver;

const REPAINT_INTERVAL: Duration = Duration::from_millis(33);

/// Window showing the mirrored camera preview with the skeleton overlay on top.
pub struct PoseOverlayApp {
    frames: FrameReceiver,
    overlay: watch::Receiver<OverlayFrame>,
    cancel: CancellationToken,
    mirror_preview: bool,

    video_texture: Option<egui::TextureHandle>,
    overlay_texture: Option<egui::TextureHandle>,
    video_size: Option<[usize; 2]>,
    current: OverlayFrame,
}

impl PoseOverlayApp {
    pub fn new(
        _cc: &eframe::CreationContext<'_>,
        frames: FrameReceiver,
        overlay: watch::Receiver<OverlayFrame>,
        cancel: CancellationToken,
        mirror_preview: bool,
    ) -> Self {
        let current = overlay.borrow().clone();
        Self {
            frames,
            overlay,
            cancel,
            mirror_preview,
            video_texture: None,
            overlay_texture: None,
            video_size: None,
            current,
        }
    }

    fn sync_textures(&mut self, ctx: &egui::Context) {
        if self.frames.has_changed().unwrap_or(false) {
            let frame = self.frames.borrow_and_update().clone();
            if let Some(frame) = frame {
                let image = if self.mirror_preview {
                    image::imageops::flip_horizontal(&frame.image)
                } else {
                    frame.image.clone()
                };
                let size = [image.width() as usize, image.height() as usize];
                let color = egui::ColorImage::from_rgb(size, image.as_raw());
                upload(ctx, &mut self.video_texture, "video", color);
                self.video_size = Some(size);
            }
        }

        if self.overlay.has_changed().unwrap_or(false) {
            self.current = self.overlay.borrow_and_update().clone();
            let image = &self.current.image;
            let size = [image.width() as usize, image.height() as usize];
            let color = egui::ColorImage::from_rgba_unmultiplied(size, image.as_raw());
            upload(ctx, &mut self.overlay_texture, "overlay", color);
        }
    }

    fn render_status_bar(&self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.add_space(6.0);
            ui.horizontal(|ui| {
                let (color, text) = status_text(&self.current.status);
                ui.colored_label(color, text);
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.label(format!("cycle {}", self.current.cycle));
                });
            });
            ui.add_space(6.0);
        });
    }

    fn render_classification_panel(&self, ctx: &egui::Context) {
        egui::SidePanel::right("classification")
            .resizable(false)
            .min_width(220.0)
            .show(ctx, |ui| {
                ui.add_space(10.0);
                ui.heading("Pose");
                ui.separator();

                let Some(result) = self.current.classification.as_ref() else {
                    ui.colored_label(egui::Color32::GRAY, "No classification yet");
                    return;
                };
                if let Some(top) = result.top() {
                    ui.label(egui::RichText::new(top.label.as_str()).size(24.0).strong());
                }
                ui.add_space(8.0);
                for entry in &result.ranked {
                    ui.label(entry.label.as_str());
                    ui.add(egui::ProgressBar::new(entry.confidence.clamp(0.0, 1.0)).show_percentage());
                }
                ui.add_space(8.0);
                ui.label(
                    egui::RichText::new(format!("updated {}", result.received_at.format("%H:%M:%S")))
                        .small()
                        .color(egui::Color32::GRAY),
                );
            });
    }

    fn render_video(&self, ctx: &egui::Context) {
        egui::CentralPanel::default().show(ctx, |ui| {
            let (Some(video), Some([w, h])) = (self.video_texture.as_ref(), self.video_size) else {
                ui.centered_and_justified(|ui| {
                    ui.spinner();
                    ui.label("Waiting for camera…");
                });
                return;
            };

            let available = ui.available_size();
            let scale = (available.x / w as f32).min(available.y / h as f32);
            let size = egui::vec2(w as f32 * scale, h as f32 * scale);
            let (rect, _) = ui.allocate_exact_size(size, egui::Sense::hover());
            let uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));

            let painter = ui.painter_at(rect);
            painter.image(video.id(), rect, uv, egui::Color32::WHITE);
            if let Some(overlay) = self.overlay_texture.as_ref() {
                painter.image(overlay.id(), rect, uv, egui::Color32::WHITE);
            }

            if self.current.status == TrackerStatus::LoadingDetector {
                painter.rect_filled(rect, egui::Rounding::ZERO, egui::Color32::from_black_alpha(160));
                painter.text(
                    rect.center(),
                    egui::Align2::CENTER_CENTER,
                    "Loading pose detector…",
                    egui::FontId::proportional(28.0),
                    egui::Color32::WHITE,
                );
            }
        });
    }
}

fn upload(ctx: &egui::Context, slot: &mut Option<egui::TextureHandle>, name: &str, image: egui::ColorImage) {
    match slot {
        Some(texture) => texture.set(image, egui::TextureOptions::LINEAR),
        None => *slot = Some(ctx.load_texture(name, image, egui::TextureOptions::LINEAR)),
    }
}

fn status_text(status: &TrackerStatus) -> (egui::Color32, String) {
    match status {
        TrackerStatus::LoadingDetector => (egui::Color32::GRAY, "Loading pose detector".to_string()),
        TrackerStatus::Tracking => (egui::Color32::from_rgb(76, 175, 80), "Tracking".to_string()),
        TrackerStatus::Recovering { consecutive_gaps } => (
            egui::Color32::from_rgb(255, 152, 0),
            format!("No pose found ({} in a row), retrying", consecutive_gaps),
        ),
        TrackerStatus::DetectorFailed { message } => {
            (egui::Color32::from_rgb(244, 67, 54), format!("Detector unavailable: {}", message))
        }
        TrackerStatus::Stopped => (egui::Color32::GRAY, "Stopped".to_string()),
    }
}

impl eframe::App for PoseOverlayApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.sync_textures(ctx);

        self.render_status_bar(ctx);
        self.render_classification_panel(ctx);
        self.render_video(ctx);

        ctx.request_repaint_after(REPAINT_INTERVAL);
    }
}

impl Drop for PoseOverlayApp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
