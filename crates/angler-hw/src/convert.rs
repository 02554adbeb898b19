//! Raw V4L2 buffers → 8-bit grayscale.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{format:?} buffer too short: expected {expected}, got {actual}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel formats the camera will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed; the Y channel is kept.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, high byte kept.
    Y16,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Grey => 1,
            PixelFormat::Yuyv | PixelFormat::Y16 => 2,
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }
}

/// Convert one buffer of `width * height` pixels to grayscale.
pub fn to_grayscale(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * format.bytes_per_pixel();
    if buf.len() < expected {
        return Err(ConvertError::ShortBuffer {
            format,
            expected,
            actual: buf.len(),
        });
    }

    let gray = match format {
        PixelFormat::Grey => buf[..pixels].to_vec(),
        // [Y0, U, Y1, V]: luma sits on even bytes.
        PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
        PixelFormat::Y16 => buf[..expected]
            .chunks_exact(2)
            .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
            .collect(),
    };
    Ok(gray)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_keeps_luma() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = to_grayscale(PixelFormat::Yuyv, &yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let buf = [0x34, 0x12, 0xff, 0x80];
        assert_eq!(to_grayscale(PixelFormat::Y16, &buf, 2, 1).unwrap(), vec![0x12, 0x80]);
    }

    #[test]
    fn test_grey_ignores_trailing_padding() {
        let buf = [1, 2, 3, 4, 99, 99];
        assert_eq!(to_grayscale(PixelFormat::Grey, &buf, 2, 2).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_buffer() {
        let err = to_grayscale(PixelFormat::Yuyv, &[100, 128], 2, 1).unwrap_err();
        assert_eq!(
            err,
            ConvertError::ShortBuffer { format: PixelFormat::Yuyv, expected: 4, actual: 2 }
        );
    }

    #[test]
    fn test_fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"GREY"), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(b"Y16 "), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }
}
