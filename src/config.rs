// src/config.rs - Application settings, read once at startup
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::{ClassifierOptions, ModelSource};
use crate::detector::DetectorConfig;
use crate::tracking::TrackerConfig;
use crate::video::VideoConfig;

pub const CONFIG_ENV: &str = "POSE_OVERLAY_CONFIG";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub video: VideoConfig,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    /// No classifier runs when absent.
    pub classifier: Option<ClassifierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub options: ClassifierOptions,
    pub source: ModelSource,
}

impl AppConfig {
    /// Loads from `$POSE_OVERLAY_CONFIG`, else the per-user config file, else defaults.
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            path => {
                debug!(path = ?path, "no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_json(&text).with_context(|| format!("invalid config {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.tracker.acceptance_threshold),
            "tracker.acceptance_threshold must be within 0..=1, got {}",
            self.tracker.acceptance_threshold
        );
        anyhow::ensure!(
            self.video.width > 0 && self.video.height > 0,
            "video size must be non-zero"
        );
        Ok(())
    }
}

pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "PoseOverlay", "pose_overlay")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ModelVariant;

    #[test]
    fn empty_object_gives_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config.tracker.poll_interval_ms, 800);
        assert_eq!(config.tracker.acceptance_threshold, 0.3);
        assert_eq!(config.tracker.gap_tolerance, 0);
        assert_eq!(config.detector.model_variant, ModelVariant::MultiPoseLightning);
        assert_eq!(config.detector.multi_pose_max_dimension, 128);
        assert_eq!((config.video.width, config.video.height), (1280, 720));
        assert!(config.tracker.style.mirrored);
        assert!(config.classifier.is_none());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "tracker": { "poll_interval_ms": 500, "construction_retry_ms": null },
                "classifier": {
                    "source": {
                        "model": "https://example.com/model.json",
                        "metadata": "https://example.com/model_meta.json",
                        "weights": "https://example.com/model.weights.bin"
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.tracker.poll_interval_ms, 500);
        assert_eq!(config.tracker.construction_retry(), None);
        assert_eq!(config.tracker.acceptance_threshold, 0.3);
        let classifier = config.classifier.unwrap();
        assert_eq!(classifier.options.input_size, 34);
        assert!(classifier.source.weights.ends_with(".bin"));
    }

    #[test]
    fn malformed_or_invalid_config_is_an_error() {
        assert!(AppConfig::from_json("{ not json").is_err());
        assert!(AppConfig::from_json(r#"{ "tracker": { "acceptance_threshold": 1.5 } }"#).is_err());
    }

    #[test]
    fn reads_file_and_reports_missing_path() {
        let dir = std::env::temp_dir().join(format!("pose_overlay_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, r#"{ "video": { "camera_index": 2 } }"#).unwrap();

        assert_eq!(AppConfig::from_file(&path).unwrap().video.camera_index, 2);
        let missing = AppConfig::from_file(&dir.join("absent.json")).unwrap_err();
        assert!(format!("{:#}", missing).contains("absent.json"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
