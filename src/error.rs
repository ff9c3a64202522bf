// src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to create pose detector: {0}")]
    Construction(String),
    #[error("pose estimation failed: {0}")]
    Estimation(String),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to fetch {location}: {message}")]
    Fetch { location: String, message: String },
    #[error("failed to read {location}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("model mismatch: {0}")]
    Shape(String),
    #[error("classifier input has {actual} values, expected {expected}")]
    InputSize { expected: usize, actual: usize },
    #[error("classification failed: {0}")]
    Inference(String),
}

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("failed to open camera {index}: {message}")]
    CameraOpen { index: u32, message: String },
    #[error("failed to capture frame: {0}")]
    Capture(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to load still image: {0}")]
    Image(#[from] image::ImageError),
}
