// src/keypoints.rs - Detector keypoints and the per-frame joint store
use serde::{Deserialize, Serialize};

/// Number of keypoints the detector reports per pose, in its native order.
pub const KEYPOINT_COUNT: usize = 17;

/// Length of the classifier input: x and y for every raw keypoint.
pub const FEATURE_LEN: usize = KEYPOINT_COUNT * 2;

/// Minimum confidence a keypoint needs before it is stored or drawn.
pub const ACCEPTANCE_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

impl Keypoint {
    pub fn new(name: impl Into<String>, x: f32, y: f32, score: f32) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            score,
        }
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// One detected subject for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
    pub score: Option<f32>,
    /// Track id assigned by the detector's tracker, when tracking is enabled.
    pub id: Option<u32>,
}

/// The detector's keypoints, discriminants are the output indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BodyPart {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl BodyPart {
    pub const ALL: [BodyPart; KEYPOINT_COUNT] = [
        BodyPart::Nose,
        BodyPart::LeftEye,
        BodyPart::RightEye,
        BodyPart::LeftEar,
        BodyPart::RightEar,
        BodyPart::LeftShoulder,
        BodyPart::RightShoulder,
        BodyPart::LeftElbow,
        BodyPart::RightElbow,
        BodyPart::LeftWrist,
        BodyPart::RightWrist,
        BodyPart::LeftHip,
        BodyPart::RightHip,
        BodyPart::LeftKnee,
        BodyPart::RightKnee,
        BodyPart::LeftAnkle,
        BodyPart::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BodyPart::Nose => "nose",
            BodyPart::LeftEye => "left_eye",
            BodyPart::RightEye => "right_eye",
            BodyPart::LeftEar => "left_ear",
            BodyPart::RightEar => "right_ear",
            BodyPart::LeftShoulder => "left_shoulder",
            BodyPart::RightShoulder => "right_shoulder",
            BodyPart::LeftElbow => "left_elbow",
            BodyPart::RightElbow => "right_elbow",
            BodyPart::LeftWrist => "left_wrist",
            BodyPart::RightWrist => "right_wrist",
            BodyPart::LeftHip => "left_hip",
            BodyPart::RightHip => "right_hip",
            BodyPart::LeftKnee => "left_knee",
            BodyPart::RightKnee => "right_knee",
            BodyPart::LeftAnkle => "left_ankle",
            BodyPart::RightAnkle => "right_ankle",
        }
    }
}

/// The twelve joints that take part in the drawn skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joint {
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl Joint {
    pub const COUNT: usize = 12;

    pub const ALL: [Joint; Joint::COUNT] = [
        Joint::LeftShoulder,
        Joint::RightShoulder,
        Joint::LeftElbow,
        Joint::RightElbow,
        Joint::LeftWrist,
        Joint::RightWrist,
        Joint::LeftHip,
        Joint::RightHip,
        Joint::LeftKnee,
        Joint::RightKnee,
        Joint::LeftAnkle,
        Joint::RightAnkle,
    ];

    pub fn body_part(self) -> BodyPart {
        match self {
            Joint::LeftShoulder => BodyPart::LeftShoulder,
            Joint::RightShoulder => BodyPart::RightShoulder,
            Joint::LeftElbow => BodyPart::LeftElbow,
            Joint::RightElbow => BodyPart::RightElbow,
            Joint::LeftWrist => BodyPart::LeftWrist,
            Joint::RightWrist => BodyPart::RightWrist,
            Joint::LeftHip => BodyPart::LeftHip,
            Joint::RightHip => BodyPart::RightHip,
            Joint::LeftKnee => BodyPart::LeftKnee,
            Joint::RightKnee => BodyPart::RightKnee,
            Joint::LeftAnkle => BodyPart::LeftAnkle,
            Joint::RightAnkle => BodyPart::RightAnkle,
        }
    }

    pub fn detector_index(self) -> usize {
        self.body_part().index()
    }

    pub fn name(self) -> &'static str {
        self.body_part().name()
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Latest accepted position of each tracked joint.
///
/// Rebuilt from scratch on every [`KeypointStore::update`]: a joint whose
/// keypoint is missing or not above the threshold ends up empty, there is no
/// carry-over from earlier frames.
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointStore {
    threshold: f32,
    joints: [Option<Point>; Joint::COUNT],
}

impl Default for KeypointStore {
    fn default() -> Self {
        Self::with_threshold(ACCEPTANCE_THRESHOLD)
    }
}

impl KeypointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            joints: [None; Joint::COUNT],
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn update(&mut self, raw: &[Keypoint]) {
        for joint in Joint::ALL {
            self.joints[joint.slot()] = raw
                .get(joint.detector_index())
                .filter(|kp| kp.score > self.threshold)
                .map(Keypoint::position);
        }
    }

    pub fn get(&self, joint: Joint) -> Option<Point> {
        self.joints[joint.slot()]
    }

    pub fn visible(&self) -> impl Iterator<Item = (Joint, Point)> + '_ {
        Joint::ALL
            .into_iter()
            .filter_map(|joint| self.get(joint).map(|p| (joint, p)))
    }

    pub fn is_empty(&self) -> bool {
        self.joints.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.joints = [None; Joint::COUNT];
    }
}

/// Flattens raw detector output into the classifier input vector:
/// `[kp0.x, kp0.y, kp1.x, kp1.y, ..]` in detector order.
///
/// Unlike the store this ignores confidence. Returns `None` unless the pose
/// carries exactly [`KEYPOINT_COUNT`] keypoints.
pub fn feature_vector(raw: &[Keypoint]) -> Option<Vec<f32>> {
    if raw.len() != KEYPOINT_COUNT {
        return None;
    }
    Some(raw.iter().flat_map(|kp| [kp.x, kp.y]).collect())
}
