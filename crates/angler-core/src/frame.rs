//! Grayscale still/preview frames and the pixel operations the pipeline needs.

use crate::types::PixelRect;
use serde::{Deserialize, Serialize};

/// A grayscale camera frame, unmirrored and rotation-corrected.
#[derive(Clone, PartialEq)]
pub struct RawFrame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Camera sequence number, 0 when unknown.
    pub sequence: u32,
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Clockwise rotation applied to sensor frames to make them upright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Map a degree value (any multiple of 90, possibly negative) to a rotation.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Cw90),
            180 => Some(Rotation::Cw180),
            270 => Some(Rotation::Cw270),
            _ => None,
        }
    }
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
        })
    }

    /// Uniform frame filled with one value.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            data: vec![value; width as usize * height as usize],
            width,
            height,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Horizontally flipped copy, for selfie-style previews.
    pub fn mirrored(&self) -> RawFrame {
        let w = self.width as usize;
        let mut data = Vec::with_capacity(self.data.len());
        for row in self.data.chunks_exact(w.max(1)) {
            data.extend(row.iter().rev());
        }
        RawFrame {
            data,
            width: self.width,
            height: self.height,
            sequence: self.sequence,
        }
    }

    /// Rotate the frame clockwise.
    pub fn rotated(self, rotation: Rotation) -> RawFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let (out_w, out_h) = match rotation {
            Rotation::None => return self,
            Rotation::Cw180 => (w, h),
            Rotation::Cw90 | Rotation::Cw270 => (h, w),
        };

        let mut data = vec![0u8; self.data.len()];
        for y in 0..h {
            for x in 0..w {
                let (nx, ny) = match rotation {
                    Rotation::Cw90 => (h - 1 - y, x),
                    Rotation::Cw180 => (w - 1 - x, h - 1 - y),
                    Rotation::Cw270 => (y, w - 1 - x),
                    Rotation::None => (x, y),
                };
                data[ny * out_w + nx] = self.data[y * w + x];
            }
        }

        RawFrame {
            data,
            width: out_w as u32,
            height: out_h as u32,
            sequence: self.sequence,
        }
    }

    /// Copy out a sub-image. The rectangle must lie inside the frame; use
    /// [`BoundingBox::clamp_to`](crate::BoundingBox::clamp_to) first.
    pub fn crop(&self, rect: &PixelRect) -> Option<RawFrame> {
        if rect.width == 0
            || rect.height == 0
            || rect.x + rect.width > self.width
            || rect.y + rect.height > self.height
        {
            return None;
        }

        let src_w = self.width as usize;
        let (x0, y0) = (rect.x as usize, rect.y as usize);
        let (cw, ch) = (rect.width as usize, rect.height as usize);

        let mut data = Vec::with_capacity(cw * ch);
        for y in y0..y0 + ch {
            data.extend_from_slice(&self.data[y * src_w + x0..y * src_w + x0 + cw]);
        }

        Some(RawFrame {
            data,
            width: rect.width,
            height: rect.height,
            sequence: self.sequence,
        })
    }

    /// Bilinear resize to `new_w`×`new_h`.
    pub fn resized(&self, new_w: usize, new_h: usize) -> Vec<u8> {
        bilinear_resize(
            &self.data,
            self.width as usize,
            self.height as usize,
            new_w,
            new_h,
        )
    }
}

/// Resize a grayscale buffer with bilinear interpolation (pixel-centre aligned).
pub fn bilinear_resize(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let mut resized = vec![0u8; new_w * new_h];
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return resized;
    }

    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}

/// True if more than `threshold_pct` of the pixels fall in the darkest bucket (0–31).
pub fn is_dark(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
