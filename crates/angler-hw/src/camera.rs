//! V4L2 camera capture via the `v4l` crate.

use crate::convert::{self, PixelFormat};
use angler_core::frame::{self, RawFrame, Rotation};
use angler_core::{CaptureError, StillCamera};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no usable still after {attempts} frames (all dark)")]
    AllDark { attempts: usize },
}

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::AllDark { .. } => CaptureError::DarkFrame,
            other => CaptureError::Failed(other.to_string()),
        }
    }
}

/// How to open and read the camera.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation applied to every frame.
    pub rotation: Rotation,
    /// Frames thrown away at the start of a still capture while exposure settles.
    pub warmup_frames: usize,
    /// Fraction of near-black pixels above which a still is rejected.
    pub dark_threshold: f32,
    /// Frames tried before a still capture gives up as dark.
    pub still_attempts: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            rotation: Rotation::None,
            warmup_frames: 2,
            dark_threshold: 0.95,
            still_attempts: 5,
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    settings: CameraSettings,
}

impl Camera {
    pub fn open(settings: CameraSettings) -> Result<Self, CameraError> {
        let device_path = settings.device.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; grayscale-only sensors come back as GREY or Y16.
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(&fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            rotation = ?settings.rotation,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            settings,
        })
    }

    /// Grab one live preview frame. Dark frames are passed through; the pose
    /// estimator simply finds no face in them.
    pub fn capture_frame(&self) -> Result<RawFrame, CameraError> {
        let mut stream = self.stream()?;
        self.next_frame(&mut stream)
    }

    /// Capture one still for enrollment, skipping warm-up and dark frames.
    pub fn capture_still_frame(&self) -> Result<RawFrame, CameraError> {
        let mut stream = self.stream()?;

        for _ in 0..self.settings.warmup_frames {
            stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        }

        let attempts = self.settings.still_attempts.max(1);
        for _ in 0..attempts {
            let frame = self.next_frame(&mut stream)?;
            if frame::is_dark(&frame.data, self.settings.dark_threshold) {
                tracing::debug!(seq = frame.sequence, "skipping dark still");
                continue;
            }
            return Ok(frame);
        }
        Err(CameraError::AllDark { attempts })
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
    }

    fn next_frame(&self, stream: &mut MmapStream<'_>) -> Result<RawFrame, CameraError> {
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = convert::to_grayscale(self.pixel_format, buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        let frame = RawFrame::new(gray, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?
            .with_sequence(meta.sequence);

        Ok(frame.rotated(self.settings.rotation))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl StillCamera for Camera {
    fn capture_still(&mut self) -> Result<RawFrame, CaptureError> {
        Ok(self.capture_still_frame()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dark_maps_to_dark_frame() {
        let e: CaptureError = CameraError::AllDark { attempts: 5 }.into();
        assert_eq!(e, CaptureError::DarkFrame);
    }

    #[test]
    fn test_other_errors_map_to_failed() {
        let e: CaptureError = CameraError::DeviceBusy.into();
        assert_eq!(e, CaptureError::Failed("device busy".into()));
    }

    #[test]
    fn test_open_missing_device() {
        let settings = CameraSettings {
            device: "/dev/does-not-exist-angler".into(),
            ..CameraSettings::default()
        };
        assert!(matches!(Camera::open(settings), Err(CameraError::DeviceNotFound(_))));
    }
}
