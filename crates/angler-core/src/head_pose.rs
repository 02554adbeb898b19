//! Head pose from SCRFD's five facial landmarks.
//!
//! A coarse geometric estimate, good enough to tell "turned right" from
//! "looking up" at 20°+:
//! - roll is the angle of the eye line,
//! - yaw follows the nose's horizontal offset from the eye midpoint,
//! - pitch follows where the nose sits between the eye line and the mouth line.
//!
//! Angles are reported in the subject's frame (see [`Pose`]).

use crate::capability::{InferenceError, PoseEstimator};
use crate::detector::{self, FaceDetector};
use crate::frame::RawFrame;
use crate::types::{BoundingBox, Pose};

/// Nose position between eye line (0) and mouth line (1) on a frontal face,
/// from the ArcFace 112×112 reference landmarks.
const FRONTAL_NOSE_RATIO: f32 = 0.494;
/// Nose offset (in inter-ocular distances) mapped to sin(yaw).
const YAW_GAIN: f32 = 2.0;
/// Deviation from the frontal nose ratio mapped to sin(pitch).
const PITCH_GAIN: f32 = 2.0;

/// Pose estimator backed by the SCRFD detector.
pub struct LandmarkPoseEstimator {
    detector: FaceDetector,
}

impl LandmarkPoseEstimator {
    pub fn new(detector: FaceDetector) -> Self {
        Self { detector }
    }
}

impl PoseEstimator for LandmarkPoseEstimator {
    fn detect_pose(&mut self, frame: &RawFrame) -> Result<Option<Pose>, InferenceError> {
        let faces = self.detector.detect(frame)?;
        Ok(detector::largest(faces).and_then(|face| pose_from_landmarks(face, frame.width, frame.height)))
    }
}

/// Derive a subject-frame pose from a detection. `None` without landmarks.
pub fn pose_from_landmarks(face: BoundingBox, frame_width: u32, frame_height: u32) -> Option<Pose> {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = face.landmarks?;

    let eye_mid = midpoint(left_eye, right_eye);
    let mouth_mid = midpoint(left_mouth, right_mouth);
    let (dx, dy) = (right_eye.0 - left_eye.0, right_eye.1 - left_eye.1);
    let eye_dist = (dx * dx + dy * dy).sqrt();
    if eye_dist < f32::EPSILON {
        return None;
    }

    let roll = dy.atan2(dx);

    // Undo roll so the eye line is horizontal.
    let nose = rotate_about(nose, eye_mid, -roll);
    let mouth = rotate_about(mouth_mid, eye_mid, -roll);

    let offset = (nose.0 - eye_mid.0) / eye_dist;
    let yaw_view = (offset * YAW_GAIN).clamp(-1.0, 1.0).asin().to_degrees();

    let face_height = mouth.1 - eye_mid.1;
    let pitch_view = if face_height.abs() < f32::EPSILON {
        0.0
    } else {
        let ratio = (nose.1 - eye_mid.1) / face_height;
        ((ratio - FRONTAL_NOSE_RATIO) * PITCH_GAIN).clamp(-1.0, 1.0).asin().to_degrees()
    };

    let frame_area = frame_width as f32 * frame_height as f32;
    let face_fraction = if frame_area > 0.0 {
        (face.area() / frame_area).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(Pose {
        // Viewer-frame angles negated into the subject's frame.
        yaw: -yaw_view,
        pitch: -pitch_view,
        roll: roll.to_degrees(),
        bounds: face,
        face_fraction,
    })
}

fn midpoint(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}

fn rotate_about(p: (f32, f32), origin: (f32, f32), angle: f32) -> (f32, f32) {
    let (s, c) = angle.sin_cos();
    let (x, y) = (p.0 - origin.0, p.1 - origin.1);
    (origin.0 + x * c - y * s, origin.1 + x * s + y * c)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Face with the ArcFace reference layout scaled ×2 and offset into a 640×480 frame.
    fn face_with(nose: (f32, f32)) -> BoundingBox {
        let ox = 200.0;
        let oy = 100.0;
        let p = |x: f32, y: f32| (ox + x * 2.0, oy + y * 2.0);
        BoundingBox {
            x: ox,
            y: oy,
            width: 224.0,
            height: 224.0,
            confidence: 0.9,
            landmarks: Some([
                p(38.2946, 51.6963),
                p(73.5318, 51.6963),
                p(nose.0, nose.1),
                p(41.5493, 92.3655),
                p(70.7299, 92.3655),
            ]),
        }
    }

    #[test]
    fn test_frontal_face_is_near_zero() {
        let mid_x = (38.2946 + 73.5318) / 2.0;
        let pose = pose_from_landmarks(face_with((mid_x, 71.7366)), 640, 480).unwrap();
        assert!(pose.yaw.abs() < 1.0, "yaw {}", pose.yaw);
        assert!(pose.pitch.abs() < 1.0, "pitch {}", pose.pitch);
        assert!(pose.roll.abs() < 1e-3);
        assert!((pose.face_fraction - 224.0 * 224.0 / (640.0 * 480.0)).abs() < 1e-5);
    }

    #[test]
    fn test_nose_toward_image_right_is_negative_raw_yaw() {
        // Nose shifted right by a quarter of the eye distance.
        let mid_x = (38.2946 + 73.5318) / 2.0;
        let eye_dist = 73.5318 - 38.2946;
        let pose = pose_from_landmarks(face_with((mid_x + eye_dist * 0.25, 71.7366)), 640, 480).unwrap();
        // asin(0.5) = 30° in the viewer frame.
        assert!((pose.yaw + 30.0).abs() < 0.5, "yaw {}", pose.yaw);
    }

    #[test]
    fn test_nose_toward_mouth_is_looking_down() {
        let mid_x = (38.2946 + 73.5318) / 2.0;
        let pose = pose_from_landmarks(face_with((mid_x, 82.0)), 640, 480).unwrap();
        // Raw pitch is negative; corrected (negated) pitch is positive = down.
        assert!(pose.pitch < -15.0, "pitch {}", pose.pitch);
    }

    #[test]
    fn test_roll_from_eye_line() {
        let mut face = face_with((56.0, 71.7));
        let lms = face.landmarks.as_mut().unwrap();
        // Drop the right eye so the eye line tilts by 45°.
        let dx = lms[1].0 - lms[0].0;
        lms[1].1 = lms[0].1 + dx;
        let pose = pose_from_landmarks(face, 640, 480).unwrap();
        assert!((pose.roll - 45.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_landmarks() {
        let mut face = face_with((56.0, 71.7));
        face.landmarks = None;
        assert!(pose_from_landmarks(face, 640, 480).is_none());
    }
}
