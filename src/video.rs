// src/video.rs - Frame sources and the capture thread feeding the tracker
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::VideoError;

/// Latest frame published by the capture thread. Un-mirrored.
pub type FrameReceiver = watch::Receiver<Option<Arc<VideoFrame>>>;

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub sequence: u64,
    pub image: RgbImage,
}

impl VideoFrame {
    pub fn new(sequence: u64, image: RgbImage) -> Self {
        Self { sequence, image }
    }

    pub fn blank(sequence: u64, width: u32, height: u32) -> Self {
        Self::new(sequence, RgbImage::new(width, height))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Serve this image instead of opening a camera.
    pub still_image: Option<PathBuf>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
            still_image: None,
        }
    }
}

pub trait FrameSource {
    fn read_frame(&mut self) -> Result<RgbImage, VideoError>;

    /// Pause between reads. Sources that block until a frame is ready return zero.
    fn frame_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn describe(&self) -> String;
}

pub struct CameraSource {
    index: u32,
    camera: Camera,
}

impl CameraSource {
    pub fn open(config: &VideoConfig) -> Result<Self, VideoError> {
        let index = config.camera_index;
        debug!(index, width = config.width, height = config.height, "opening camera");

        let format = CameraFormat::new(
            Resolution::new(config.width, config.height),
            FrameFormat::MJPEG,
            config.fps,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(CameraIndex::Index(index), requested).map_err(|e| {
            VideoError::CameraOpen {
                index,
                message: e.to_string(),
            }
        })?;
        camera.open_stream().map_err(|e| VideoError::CameraOpen {
            index,
            message: e.to_string(),
        })?;

        let resolution = camera.resolution();
        info!(
            index,
            width = resolution.width(),
            height = resolution.height(),
            fps = camera.frame_rate(),
            "camera stream open"
        );
        Ok(Self { index, camera })
    }
}

impl FrameSource for CameraSource {
    fn read_frame(&mut self) -> Result<RgbImage, VideoError> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| VideoError::Capture(e.to_string()))?;
        buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| VideoError::Decode(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("camera://{}", self.index)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!(index = self.index, "failed to stop camera stream: {}", e);
        }
    }
}

/// Serves one image over and over, for running without a camera.
pub struct StillImageSource {
    path: Option<PathBuf>,
    image: RgbImage,
    interval: Duration,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>, fps: u32) -> Result<Self, VideoError> {
        let path = path.as_ref().to_path_buf();
        let image = image::open(&path)?.to_rgb8();
        Ok(Self {
            path: Some(path),
            image,
            interval: interval_for(fps),
        })
    }

    pub fn from_image(image: RgbImage, fps: u32) -> Self {
        Self {
            path: None,
            image,
            interval: interval_for(fps),
        }
    }
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

impl FrameSource for StillImageSource {
    fn read_frame(&mut self) -> Result<RgbImage, VideoError> {
        Ok(self.image.clone())
    }

    fn frame_interval(&self) -> Duration {
        self.interval
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("file://{}", path.display()),
            None => "memory://still".to_string(),
        }
    }
}

/// Opens the source configured in `config`.
pub fn open_source(config: &VideoConfig) -> Result<Box<dyn FrameSource>, VideoError> {
    match &config.still_image {
        Some(path) => Ok(Box::new(StillImageSource::open(path, config.fps)?)),
        None => Ok(Box::new(CameraSource::open(config)?)),
    }
}

const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Runs the capture loop on its own thread until `cancel` fires.
///
/// The source is opened on the capture thread, camera handles are not `Send` on every backend.
pub fn spawn_capture<F>(
    open: F,
    tx: watch::Sender<Option<Arc<VideoFrame>>>,
    cancel: CancellationToken,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() -> Result<Box<dyn FrameSource>, VideoError> + Send + 'static,
{
    std::thread::Builder::new()
        .name("video-capture".to_string())
        .spawn(move || {
            let mut source = match open() {
                Ok(source) => source,
                Err(e) => {
                    error!("video source unavailable: {}", e);
                    return;
                }
            };
            info!(source = %source.describe(), "capture started");

            let mut sequence = 0u64;
            let mut failures = 0u32;
            while !cancel.is_cancelled() {
                match source.read_frame() {
                    Ok(image) => {
                        failures = 0;
                        sequence += 1;
                        tx.send_replace(Some(Arc::new(VideoFrame::new(sequence, image))));
                        let interval = source.frame_interval();
                        if !interval.is_zero() {
                            std::thread::sleep(interval);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        if failures == 1 || failures % 50 == 0 {
                            warn!(failures, "frame capture failed: {}", e);
                        }
                        std::thread::sleep(CAPTURE_RETRY_DELAY);
                    }
                }
            }
            info!(frames = sequence, "capture stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        calls: u32,
    }

    impl FrameSource for Flaky {
        fn read_frame(&mut self) -> Result<RgbImage, VideoError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                Err(VideoError::Capture("dropped".to_string()))
            } else {
                Ok(RgbImage::new(4, 3))
            }
        }

        fn frame_interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn capture_publishes_frames_until_cancelled() {
        let (tx, mut rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let handle = spawn_capture(
            || Ok(Box::new(Flaky { calls: 0 }) as Box<dyn FrameSource>),
            tx,
            cancel.clone(),
        )
        .unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            while rx.borrow().as_ref().map_or(0, |f| f.sequence) < 2 {
                rx.changed().await.unwrap();
            }
        });

        cancel.cancel();
        handle.join().unwrap();
        let last = rx.borrow().clone().unwrap();
        assert!(last.sequence >= 2);
        assert_eq!(last.dimensions(), (4, 3));
    }

    #[test]
    fn failed_open_ends_thread_without_frames() {
        let (tx, rx) = watch::channel(None);
        let handle = spawn_capture(
            || Err(VideoError::CameraOpen { index: 7, message: "busy".to_string() }),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        handle.join().unwrap();
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn still_source_repeats_image() {
        let mut source = StillImageSource::from_image(RgbImage::new(8, 8), 10);
        assert_eq!(source.frame_interval(), Duration::from_millis(100));
        assert_eq!(source.read_frame().unwrap().dimensions(), (8, 8));
        assert_eq!(source.read_frame().unwrap().dimensions(), (8, 8));
    }
}
