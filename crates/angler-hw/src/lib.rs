//! angler-hw — V4L2 camera access for the capture pipeline.
//!
//! Frames leave this crate as grayscale, rotation-corrected and unmirrored
//! [`RawFrame`](angler_core::RawFrame)s.

pub mod camera;
pub mod convert;

pub use camera::{Camera, CameraError, CameraSettings, DeviceInfo};
pub use convert::PixelFormat;
