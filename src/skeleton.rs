// src/skeleton.rs
use crate::keypoints::Joint;

/// A drawn segment between two tracked joints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bone {
    pub from: Joint,
    pub to: Joint,
}

const fn bone(from: Joint, to: Joint) -> Bone {
    Bone { from, to }
}

/// Torso, arms and legs. Face keypoints are drawn as points only.
pub const BONES: [Bone; 12] = [
    bone(Joint::LeftShoulder, Joint::RightShoulder),
    bone(Joint::LeftShoulder, Joint::LeftElbow),
    bone(Joint::LeftElbow, Joint::LeftWrist),
    bone(Joint::RightShoulder, Joint::RightElbow),
    bone(Joint::RightElbow, Joint::RightWrist),
    bone(Joint::LeftHip, Joint::RightHip),
    bone(Joint::LeftShoulder, Joint::LeftHip),
    bone(Joint::RightShoulder, Joint::RightHip),
    bone(Joint::LeftHip, Joint::LeftKnee),
    bone(Joint::RightHip, Joint::RightKnee),
    bone(Joint::LeftKnee, Joint::LeftAnkle),
    bone(Joint::RightKnee, Joint::RightAnkle),
];

pub fn bones() -> &'static [Bone] {
    &BONES
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_tracked_joint_is_connected() {
        let used: HashSet<Joint> = bones().iter().flat_map(|b| [b.from, b.to]).collect();
        assert_eq!(used.len(), Joint::COUNT);
    }

    #[test]
    fn bones_are_unique() {
        let mut seen = HashSet::new();
        for b in bones() {
            assert_ne!(b.from, b.to);
            let key = if (b.from as u8) < (b.to as u8) { (b.from, b.to) } else { (b.to, b.from) };
            assert!(seen.insert(key), "duplicate bone {:?}", b);
        }
        assert_eq!(seen.len(), 12);
    }
}
