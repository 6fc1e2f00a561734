//! Raw frame bytes to typed pixel arrays.

use crate::error::{CaptureError, CaptureResult};
use crate::messages::FrameShape;
use ndarray::{Array2, Array3};

/// A decoded frame. Mono/raw-Bayer frames are `(height, width)`, color frames are
/// `(height, width, 3)` with interleaved channels.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// 8-bit single channel
    Mono8(Array2<u8>),
    /// 16-bit single channel
    Mono16(Array2<u16>),
    /// 8-bit, 3 channels
    Color8(Array3<u8>),
    /// 16-bit, 3 channels
    Color16(Array3<u16>),
}

impl DecodedFrame {
    /// Rows
    pub fn height(&self) -> usize {
        match self {
            DecodedFrame::Mono8(a) => a.nrows(),
            DecodedFrame::Mono16(a) => a.nrows(),
            DecodedFrame::Color8(a) => a.dim().0,
            DecodedFrame::Color16(a) => a.dim().0,
        }
    }

    /// Columns
    pub fn width(&self) -> usize {
        match self {
            DecodedFrame::Mono8(a) => a.ncols(),
            DecodedFrame::Mono16(a) => a.ncols(),
            DecodedFrame::Color8(a) => a.dim().1,
            DecodedFrame::Color16(a) => a.dim().1,
        }
    }

    /// 1 or 3
    pub fn channels(&self) -> usize {
        match self {
            DecodedFrame::Mono8(_) | DecodedFrame::Mono16(_) => 1,
            DecodedFrame::Color8(a) => a.dim().2,
            DecodedFrame::Color16(a) => a.dim().2,
        }
    }

    /// 8 or 16
    pub fn bit_depth(&self) -> u32 {
        match self {
            DecodedFrame::Mono8(_) | DecodedFrame::Color8(_) => 8,
            DecodedFrame::Mono16(_) | DecodedFrame::Color16(_) => 16,
        }
    }

    /// Array rank: 2 for mono, 3 for color.
    pub fn ndim(&self) -> usize {
        if self.channels() == 1 {
            2
        } else {
            3
        }
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.height() * self.width() * self.channels()
    }

    /// True for a zero-sized frame.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interpret `raw` as a frame of the given shape.
///
/// Samples are unsigned 8-bit, or 16-bit little-endian. The byte length must match the shape
/// exactly; a shorter or longer buffer is a [`CaptureError::FrameSize`].
pub fn decode(raw: &[u8], shape: &FrameShape) -> CaptureResult<DecodedFrame> {
    let bytes_per_sample = match shape.bit_depth {
        8 => 1,
        16 => 2,
        other => {
            return Err(CaptureError::UnsupportedFormat(format!(
                "bit depth {other} (expected 8 or 16)"
            )))
        }
    };
    if shape.channels != 1 && shape.channels != 3 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "{} channels (expected 1 or 3)",
            shape.channels
        )));
    }

    let h = shape.height as usize;
    let w = shape.width as usize;
    let c = shape.channels as usize;
    let expected = h * w * c * bytes_per_sample;
    if raw.len() != expected {
        return Err(CaptureError::FrameSize {
            expected,
            actual: raw.len(),
        });
    }

    let frame = match (bytes_per_sample, c) {
        (1, 1) => DecodedFrame::Mono8(Array2::from_shape_vec((h, w), raw.to_vec()).map_err(shape_err)?),
        (1, _) => DecodedFrame::Color8(
            Array3::from_shape_vec((h, w, c), raw.to_vec()).map_err(shape_err)?,
        ),
        (_, 1) => DecodedFrame::Mono16(Array2::from_shape_vec((h, w), le_u16(raw)).map_err(shape_err)?),
        (_, _) => DecodedFrame::Color16(
            Array3::from_shape_vec((h, w, c), le_u16(raw)).map_err(shape_err)?,
        ),
    };
    Ok(frame)
}

fn le_u16(raw: &[u8]) -> Vec<u16> {
    raw.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn shape_err(e: ndarray::ShapeError) -> CaptureError {
    CaptureError::Buffer(format!("cannot shape frame: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono8_shape_is_height_by_width() {
        let raw: Vec<u8> = (0..12).collect();
        let frame = decode(&raw, &FrameShape::new(4, 3, 1, 8)).unwrap();
        let DecodedFrame::Mono8(a) = &frame else {
            panic!("expected Mono8");
        };
        assert_eq!(a.dim(), (3, 4));
        assert_eq!(a[[1, 0]], 4);
        assert_eq!(frame.len(), 12);
        assert_eq!(frame.ndim(), 2);
    }

    #[test]
    fn mono16_is_little_endian() {
        let raw = [0x34, 0x12, 0xFF, 0xFF];
        let frame = decode(&raw, &FrameShape::new(2, 1, 1, 16)).unwrap();
        let DecodedFrame::Mono16(a) = frame else {
            panic!("expected Mono16");
        };
        assert_eq!(a[[0, 0]], 0x1234);
        assert_eq!(a[[0, 1]], 0xFFFF);
    }

    #[test]
    fn color_is_channel_interleaved() {
        let raw: Vec<u8> = vec![1, 2, 3, 4, 5, 6];
        let frame = decode(&raw, &FrameShape::new(2, 1, 3, 8)).unwrap();
        let DecodedFrame::Color8(a) = &frame else {
            panic!("expected Color8");
        };
        assert_eq!(a.dim(), (1, 2, 3));
        assert_eq!(a[[0, 1, 0]], 4);
        assert_eq!(a[[0, 1, 2]], 6);
        assert_eq!(frame.channels(), 3);
    }

    #[test]
    fn color16_shape() {
        let raw = vec![0u8; 2 * 2 * 3 * 2];
        let frame = decode(&raw, &FrameShape::new(2, 2, 3, 16)).unwrap();
        assert!(matches!(frame, DecodedFrame::Color16(_)));
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn wrong_length_is_rejected_both_ways() {
        let shape = FrameShape::new(4, 4, 1, 16);
        let short = vec![0u8; 31];
        let long = vec![0u8; 33];
        assert!(matches!(
            decode(&short, &shape),
            Err(CaptureError::FrameSize {
                expected: 32,
                actual: 31
            })
        ));
        assert!(matches!(
            decode(&long, &shape),
            Err(CaptureError::FrameSize { actual: 33, .. })
        ));
    }

    #[test]
    fn unsupported_depth_and_channels() {
        assert!(matches!(
            decode(&[0u8; 4], &FrameShape::new(2, 2, 1, 12)),
            Err(CaptureError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            decode(&[0u8; 8], &FrameShape::new(2, 2, 2, 8)),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }
}
