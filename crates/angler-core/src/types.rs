//! Shared data model: poses, targets, face boxes, embeddings and identity records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Snap the box to whole pixels inside a `width`×`height` image.
    ///
    /// The left/top edge is kept inside the image and the right/bottom edge is
    /// forced at least one pixel past it, so any box that touches the image
    /// yields a non-empty rectangle. Returns `None` only for an empty image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        if width == 0 || height == 0 {
            return None;
        }
        let (w, h) = (width as i64, height as i64);

        let left = (self.x.floor() as i64).clamp(0, w - 1);
        let top = (self.y.floor() as i64).clamp(0, h - 1);
        let right = ((self.x + self.width).ceil() as i64).clamp(left + 1, w);
        let bottom = ((self.y + self.height).ceil() as i64).clamp(top + 1, h);

        Some(PixelRect {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}

/// Integer rectangle in frame pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Head pose for one frame, as reported by a [`PoseEstimator`](crate::PoseEstimator).
///
/// Angles are in degrees and in the subject's own frame of reference, which is
/// mirrored relative to the viewer: a subject turning toward the viewer's
/// right reports a negative yaw, and looking up reports a positive pitch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub bounds: BoundingBox,
    /// Face box area over frame area, in [0, 1].
    pub face_fraction: f32,
}

/// One of the head orientations the user is asked to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseTarget {
    LookRight,
    LookLeft,
    LookUp,
    LookDown,
}

impl PoseTarget {
    /// Capture order used by a standard enrollment session.
    pub const SEQUENCE: [PoseTarget; 4] = [
        PoseTarget::LookRight,
        PoseTarget::LookLeft,
        PoseTarget::LookUp,
        PoseTarget::LookDown,
    ];

    /// Short instruction shown to the user.
    pub fn instruction(self) -> &'static str {
        match self {
            PoseTarget::LookRight => "Look Right",
            PoseTarget::LookLeft => "Look Left",
            PoseTarget::LookUp => "Look Up",
            PoseTarget::LookDown => "Look Down",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PoseTarget::LookRight => "look_right",
            PoseTarget::LookLeft => "look_left",
            PoseTarget::LookUp => "look_up",
            PoseTarget::LookDown => "look_down",
        }
    }
}

impl fmt::Display for PoseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pose target: {0}")]
pub struct UnknownPoseTarget(pub String);

impl FromStr for PoseTarget {
    type Err = UnknownPoseTarget;

    /// Accepts both the snake_case name and the instruction text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "look_right" | "right" => Ok(PoseTarget::LookRight),
            "look_left" | "left" => Ok(PoseTarget::LookLeft),
            "look_up" | "up" => Ok(PoseTarget::LookUp),
            "look_down" | "down" => Ok(PoseTarget::LookDown),
            _ => Err(UnknownPoseTarget(s.to_string())),
        }
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Store-assigned identity key. Opaque to everything but the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        IdentityId(s.to_string())
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub name: String,
    /// Number of images the enrollment declared; see [`DeclaredCount`](crate::DeclaredCount).
    pub declared_image_count: usize,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// One stored face embedding belonging to an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub identity_id: IdentityId,
    pub identity_name: String,
    pub embedding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_clamp_inside_image() {
        let rect = bbox(10.0, 20.0, 30.0, 40.0).clamp_to(100, 100).unwrap();
        assert_eq!(rect, PixelRect { x: 10, y: 20, width: 30, height: 40 });
    }

    #[test]
    fn test_clamp_overhanging_box() {
        let rect = bbox(-15.0, 80.0, 50.0, 60.0).clamp_to(100, 100).unwrap();
        assert_eq!(rect, PixelRect { x: 0, y: 80, width: 35, height: 20 });
    }

    #[test]
    fn test_clamp_box_outside_image_is_one_pixel() {
        let rect = bbox(150.0, 150.0, 10.0, 10.0).clamp_to(100, 100).unwrap();
        assert_eq!(rect, PixelRect { x: 99, y: 99, width: 1, height: 1 });
    }

    #[test]
    fn test_clamp_empty_image() {
        assert!(bbox(0.0, 0.0, 10.0, 10.0).clamp_to(0, 10).is_none());
    }

    #[test]
    fn test_pose_target_parse() {
        assert_eq!("Look Right".parse::<PoseTarget>().unwrap(), PoseTarget::LookRight);
        assert_eq!("look_down".parse::<PoseTarget>().unwrap(), PoseTarget::LookDown);
        assert_eq!("LEFT".parse::<PoseTarget>().unwrap(), PoseTarget::LookLeft);
        assert!("Look Sideways".parse::<PoseTarget>().is_err());
    }

    #[test]
    fn test_pose_target_serde_matches_display() {
        for target in PoseTarget::SEQUENCE {
            let json = serde_json::to_string(&target).unwrap();
            assert_eq!(json, format!("\"{target}\""));
        }
    }
}
