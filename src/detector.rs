// src/detector.rs - Pose detector capability and a simulated detector
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DetectorError;
use crate::keypoints::{BodyPart, Keypoint, Pose};
use crate::video::VideoFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    SinglePoseLightning,
    SinglePoseThunder,
    /// Multi-person model tuned for speed.
    MultiPoseLightning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    BoundingBox,
    Keypoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_variant: ModelVariant,
    pub enable_tracking: bool,
    pub tracker_type: TrackerKind,
    /// Bound on the longer input side for the multi-pose path.
    pub multi_pose_max_dimension: u32,
    pub simulation: SimulationConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_variant: ModelVariant::MultiPoseLightning,
            enable_tracking: true,
            tracker_type: TrackerKind::BoundingBox,
            multi_pose_max_dimension: 128,
            simulation: SimulationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Return no pose on every n-th estimate. 0 disables dropouts.
    pub drop_every: u32,
    /// Seconds of simulated time advanced per estimate.
    pub time_step: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            drop_every: 0,
            time_step: 0.8,
        }
    }
}

/// A constructed detector instance.
#[async_trait]
pub trait PoseDetector: Send {
    /// Zero or more poses for the frame, most prominent first.
    async fn estimate_poses(&mut self, frame: &VideoFrame) -> Result<Vec<Pose>, DetectorError>;
}

#[async_trait]
pub trait DetectorFactory: Send + Sync {
    async fn create(&self, config: &DetectorConfig) -> Result<Box<dyn PoseDetector>, DetectorError>;
}

/// Synthetic figure standing in the middle of the frame, swaying and waving.
/// Ignores pixel content.
pub struct SimulatedDetector {
    config: DetectorConfig,
    sim_time: f32,
    calls: u64,
}

impl SimulatedDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            sim_time: 0.0,
            calls: 0,
        }
    }

    fn pose_for(&self, width: f32, height: f32) -> Pose {
        let t = self.sim_time;
        let body = height * 0.8;
        let cx = width * 0.5 + width * 0.08 * (t * 0.4).sin();
        let top = height * 0.1;
        let wave = (t * 1.3).sin();

        // (dx, dy) in body heights relative to the head-top center.
        let offset = |part: BodyPart| -> (f32, f32) {
            match part {
                BodyPart::Nose => (0.0, 0.06),
                BodyPart::LeftEye => (0.02, 0.045),
                BodyPart::RightEye => (-0.02, 0.045),
                BodyPart::LeftEar => (0.045, 0.055),
                BodyPart::RightEar => (-0.045, 0.055),
                BodyPart::LeftShoulder => (0.11, 0.17),
                BodyPart::RightShoulder => (-0.11, 0.17),
                BodyPart::LeftElbow => (0.2, 0.3 - 0.08 * wave),
                BodyPart::RightElbow => (-0.17, 0.33),
                BodyPart::LeftWrist => (0.25, 0.42 - 0.3 * wave),
                BodyPart::RightWrist => (-0.19, 0.48),
                BodyPart::LeftHip => (0.08, 0.52),
                BodyPart::RightHip => (-0.08, 0.52),
                BodyPart::LeftKnee => (0.09, 0.74),
                BodyPart::RightKnee => (-0.09, 0.74),
                BodyPart::LeftAnkle => (0.1, 0.96),
                BodyPart::RightAnkle => (-0.1, 0.96),
            }
        };

        // Feet drift in and out of confidence, so the legs flicker like a real model at the frame edge.
        let feet_score = 0.45 + 0.3 * (t * 0.7).sin();

        let keypoints = BodyPart::ALL
            .iter()
            .map(|&part| {
                let (dx, dy) = offset(part);
                let score = match part {
                    BodyPart::LeftAnkle | BodyPart::RightAnkle => feet_score,
                    BodyPart::LeftEar | BodyPart::RightEar => 0.55,
                    _ => 0.9,
                };
                Keypoint::new(part.name(), cx + dx * body, top + dy * body, score)
            })
            .collect();

        Pose {
            keypoints,
            score: Some(0.85),
            id: self.config.enable_tracking.then_some(1),
        }
    }
}

#[async_trait]
impl PoseDetector for SimulatedDetector {
    async fn estimate_poses(&mut self, frame: &VideoFrame) -> Result<Vec<Pose>, DetectorError> {
        self.calls += 1;
        self.sim_time += self.config.simulation.time_step;

        let drop_every = u64::from(self.config.simulation.drop_every);
        if drop_every > 0 && self.calls % drop_every == 0 {
            debug!(call = self.calls, "simulated detector dropping frame");
            return Ok(Vec::new());
        }

        let (width, height) = frame.dimensions();
        Ok(vec![self.pose_for(width as f32, height as f32)])
    }
}

#[derive(Debug, Default)]
pub struct SimulatedDetectorFactory;

#[async_trait]
impl DetectorFactory for SimulatedDetectorFactory {
    async fn create(&self, config: &DetectorConfig) -> Result<Box<dyn PoseDetector>, DetectorError> {
        if config.multi_pose_max_dimension == 0 {
            return Err(DetectorError::Construction(
                "multi_pose_max_dimension must be positive".to_string(),
            ));
        }
        info!(
            variant = ?config.model_variant,
            tracking = config.enable_tracking,
            tracker = ?config.tracker_type,
            max_dimension = config.multi_pose_max_dimension,
            "simulated pose detector loaded"
        );
        Ok(Box::new(SimulatedDetector::new(config.clone())))
    }
}
