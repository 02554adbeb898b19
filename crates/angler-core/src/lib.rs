//! angler-core — guided multi-pose face capture and enrollment.
//!
//! Walks a user through a fixed sequence of head poses, captures one still per
//! pose once it has been held steadily, and turns the approved stills into an
//! identity with one embedding per usable face. Face detection (SCRFD) and
//! recognition (ArcFace) run via ONNX Runtime.

pub mod capability;
pub mod classifier;
pub mod debounce;
pub mod detector;
pub mod finalizer;
pub mod frame;
pub mod head_pose;
pub mod recognizer;
pub mod sequencer;
pub mod smoother;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capability::{
    remove_identity, CaptureError, EmbeddingExtractor, FaceLocator, IdentityStore, InferenceError, PoseEstimator,
    SharedExtractor, StillCamera, StoreError,
};
pub use classifier::Thresholds;
pub use finalizer::{DeclaredCount, EnrollmentReport, FinalizeError, FinalizeOutcome, Finalizer};
pub use frame::{RawFrame, Rotation};
pub use sequencer::{CaptureSession, Phase, SessionConfig, SessionError, SessionStatus};
pub use types::{BoundingBox, Embedding, EmbeddingRecord, IdentityId, IdentityRecord, Pose, PoseTarget};
