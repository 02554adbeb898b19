//! Per-frame pose classification against a requested target.
//!
//! Pose estimators report angles from the subject's point of view. The
//! classifier negates yaw and pitch so that a positive corrected yaw means the
//! subject turned toward the viewer's right and a negative corrected pitch
//! means the subject looked up, then smooths and thresholds the result.

use crate::smoother::{Axis, PoseSmoother};
use crate::types::{Pose, PoseTarget};
use serde::{Deserialize, Serialize};

/// Angle and size thresholds, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum |corrected yaw| in degrees for LookRight/LookLeft.
    pub yaw_enter: f32,
    /// Corrected pitch must fall below this (negative) for LookUp.
    pub pitch_up_enter: f32,
    /// Corrected pitch must rise above this (positive) for LookDown.
    pub pitch_down_enter: f32,
    /// Frames with |roll| above this are rejected.
    pub roll_abs_max: f32,
    /// Frames whose face covers less than this fraction of the image are rejected.
    pub min_face_fraction: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            yaw_enter: 22.0,
            pitch_up_enter: -15.0,
            pitch_down_enter: 15.0,
            roll_abs_max: 12.0,
            min_face_fraction: 0.06,
        }
    }
}

/// Why a frame was rejected before any target rule was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoFace,
    FaceTooSmall,
    HeadTilted,
}

/// Outcome of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    Rejected(RejectReason),
    Mismatch { yaw_avg: f32, pitch_avg: f32 },
    Match { yaw_avg: f32, pitch_avg: f32 },
}

impl Classification {
    pub fn is_match(&self) -> bool {
        matches!(self, Classification::Match { .. })
    }
}

/// Check the target-independent preconditions on a raw pose.
pub fn check_preconditions(pose: &Pose, thresholds: &Thresholds) -> Result<(), RejectReason> {
    if pose.face_fraction < thresholds.min_face_fraction {
        return Err(RejectReason::FaceTooSmall);
    }
    if pose.roll.abs() > thresholds.roll_abs_max {
        return Err(RejectReason::HeadTilted);
    }
    Ok(())
}

/// Apply a target rule to corrected, smoothed angles.
pub fn matches_target(target: PoseTarget, yaw_avg: f32, pitch_avg: f32, thresholds: &Thresholds) -> bool {
    match target {
        PoseTarget::LookRight => yaw_avg > thresholds.yaw_enter,
        PoseTarget::LookLeft => yaw_avg < -thresholds.yaw_enter,
        PoseTarget::LookUp => pitch_avg < thresholds.pitch_up_enter,
        PoseTarget::LookDown => pitch_avg > thresholds.pitch_down_enter,
    }
}

/// Classify one frame's pose against `target`, feeding the smoother.
///
/// Rejected frames (no face, face too small, head tilted) leave the windows
/// untouched. Accepted frames push corrected yaw/pitch and raw roll before the
/// rule is evaluated on the window averages.
pub fn classify(
    pose: Option<&Pose>,
    target: PoseTarget,
    smoother: &mut PoseSmoother,
    thresholds: &Thresholds,
) -> Classification {
    let Some(pose) = pose else {
        return Classification::Rejected(RejectReason::NoFace);
    };
    if let Err(reason) = check_preconditions(pose, thresholds) {
        return Classification::Rejected(reason);
    }

    smoother.push(Axis::Yaw, -pose.yaw);
    smoother.push(Axis::Pitch, -pose.pitch);
    smoother.push(Axis::Roll, pose.roll);

    let yaw_avg = smoother.average(Axis::Yaw);
    let pitch_avg = smoother.average(Axis::Pitch);

    if matches_target(target, yaw_avg, pitch_avg, thresholds) {
        Classification::Match { yaw_avg, pitch_avg }
    } else {
        Classification::Mismatch { yaw_avg, pitch_avg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn pose(yaw: f32, pitch: f32, roll: f32, face_fraction: f32) -> Pose {
        Pose {
            yaw,
            pitch,
            roll,
            bounds: BoundingBox {
                x: 0.0, y: 0.0, width: 10.0, height: 10.0,
                confidence: 0.9, landmarks: None,
            },
            face_fraction,
        }
    }

    fn feed(raw_yaw: f32, n: usize, target: PoseTarget, thresholds: &Thresholds) -> Classification {
        let mut s = PoseSmoother::new(5);
        let mut last = Classification::Rejected(RejectReason::NoFace);
        for _ in 0..n {
            last = classify(Some(&pose(raw_yaw, 0.0, 0.0, 0.1)), target, &mut s, thresholds);
        }
        last
    }

    #[test]
    fn test_sign_correction_look_left_below_threshold() {
        // Raw +20 is the subject's right, which the viewer sees as a turn to the left.
        let t = Thresholds { yaw_enter: 22.0, ..Thresholds::default() };
        let c = feed(20.0, 5, PoseTarget::LookLeft, &t);
        assert!(!c.is_match());
        if let Classification::Mismatch { yaw_avg, .. } = c {
            assert!((yaw_avg + 20.0).abs() < 1e-5);
        } else {
            panic!("expected mismatch, got {c:?}");
        }
    }

    #[test]
    fn test_sign_correction_look_left_above_threshold() {
        let t = Thresholds { yaw_enter: 18.0, ..Thresholds::default() };
        assert!(feed(20.0, 5, PoseTarget::LookLeft, &t).is_match());
        assert!(!feed(20.0, 5, PoseTarget::LookRight, &t).is_match());
    }

    #[test]
    fn test_pitch_rules() {
        let t = Thresholds::default();
        // Raw pitch +20 corrects to -20: looking up.
        let mut s = PoseSmoother::new(5);
        let c = classify(Some(&pose(0.0, 20.0, 0.0, 0.1)), PoseTarget::LookUp, &mut s, &t);
        assert!(c.is_match());

        let mut s = PoseSmoother::new(5);
        let c = classify(Some(&pose(0.0, -20.0, 0.0, 0.1)), PoseTarget::LookDown, &mut s, &t);
        assert!(c.is_match());

        let mut s = PoseSmoother::new(5);
        let c = classify(Some(&pose(0.0, -10.0, 0.0, 0.1)), PoseTarget::LookDown, &mut s, &t);
        assert!(!c.is_match());
    }

    #[test]
    fn test_small_face_rejected_without_sampling() {
        let t = Thresholds::default();
        let mut s = PoseSmoother::new(5);
        let c = classify(Some(&pose(-40.0, 0.0, 0.0, 0.01)), PoseTarget::LookRight, &mut s, &t);
        assert_eq!(c, Classification::Rejected(RejectReason::FaceTooSmall));
        assert!(s.is_empty());
    }

    #[test]
    fn test_tilted_head_rejected() {
        let t = Thresholds::default();
        let mut s = PoseSmoother::new(5);
        let c = classify(Some(&pose(-40.0, 0.0, -13.0, 0.2)), PoseTarget::LookRight, &mut s, &t);
        assert_eq!(c, Classification::Rejected(RejectReason::HeadTilted));
        // Exactly at the limit is allowed.
        let c = classify(Some(&pose(-40.0, 0.0, 12.0, 0.2)), PoseTarget::LookRight, &mut s, &t);
        assert!(c.is_match());
    }

    #[test]
    fn test_no_face_rejected() {
        let mut s = PoseSmoother::new(5);
        let c = classify(None, PoseTarget::LookUp, &mut s, &Thresholds::default());
        assert_eq!(c, Classification::Rejected(RejectReason::NoFace));
    }

    #[test]
    fn test_smoothing_delays_match() {
        let t = Thresholds::default();
        let mut s = PoseSmoother::new(5);
        // Four neutral frames then one strong right turn: average is 40/5 = 8.
        for _ in 0..4 {
            classify(Some(&pose(0.0, 0.0, 0.0, 0.1)), PoseTarget::LookRight, &mut s, &t);
        }
        let c = classify(Some(&pose(-40.0, 0.0, 0.0, 0.1)), PoseTarget::LookRight, &mut s, &t);
        assert!(!c.is_match());
    }

    #[test]
    fn test_unknown_named_target_never_matches() {
        let t = Thresholds::default();
        assert!("Look Sideways".parse::<PoseTarget>().is_err());
        let right: PoseTarget = "Look Right".parse().unwrap();
        assert!(matches_target(right, 30.0, 0.0, &t));
    }
}
