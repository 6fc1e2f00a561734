//! Software demosaic of raw Bayer frames.

use crate::data::decoder::DecodedFrame;
use crate::error::{CaptureError, CaptureResult};
use bayer::{BayerDepth, Demosaic, RasterDepth, RasterMut, CFA};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Color filter array layout of the sensor, or `None` to leave frames as they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BayerPattern {
    /// No software debayer
    #[default]
    None,
    /// Red first row, green second
    #[serde(rename = "RGGB")]
    Rggb,
    /// Blue first
    #[serde(rename = "BGGR")]
    Bggr,
    /// Green-red first row
    #[serde(rename = "GRBG")]
    Grbg,
    /// Green-blue first row
    #[serde(rename = "GBRG")]
    Gbrg,
}

impl BayerPattern {
    /// Wire and config name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BayerPattern::None => "None",
            BayerPattern::Rggb => "RGGB",
            BayerPattern::Bggr => "BGGR",
            BayerPattern::Grbg => "GRBG",
            BayerPattern::Gbrg => "GBRG",
        }
    }

    fn cfa(&self) -> Option<CFA> {
        match self {
            BayerPattern::None => None,
            BayerPattern::Rggb => Some(CFA::RGGB),
            BayerPattern::Bggr => Some(CFA::BGGR),
            BayerPattern::Grbg => Some(CFA::GRBG),
            BayerPattern::Gbrg => Some(CFA::GBRG),
        }
    }
}

impl fmt::Display for BayerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BayerPattern {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" | "" => Ok(BayerPattern::None),
            "RGGB" => Ok(BayerPattern::Rggb),
            "BGGR" => Ok(BayerPattern::Bggr),
            "GRBG" => Ok(BayerPattern::Grbg),
            "GBRG" => Ok(BayerPattern::Gbrg),
            _ => Err(CaptureError::InvalidArgument(format!(
                "unknown bayer pattern '{s}'"
            ))),
        }
    }
}

/// Demosaic a single-channel frame into RGB.
///
/// `BayerPattern::None` returns the frame unchanged. Color input and frames smaller than
/// 2x2 are rejected with [`CaptureError::UnsupportedFormat`].
pub fn debayer(frame: &DecodedFrame, pattern: BayerPattern) -> CaptureResult<DecodedFrame> {
    let Some(cfa) = pattern.cfa() else {
        return Ok(frame.clone());
    };
    let (h, w) = (frame.height(), frame.width());
    if w < 2 || h < 2 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "cannot debayer a {w}x{h} frame"
        )));
    }

    match frame {
        DecodedFrame::Mono8(a) => {
            let input: Vec<u8> = a.iter().copied().collect();
            let out = demosaic(&input, w, h, BayerDepth::Depth8, RasterDepth::Depth8, cfa, 1)?;
            let rgb = Array3::from_shape_vec((h, w, 3), out).map_err(shape_err)?;
            Ok(DecodedFrame::Color8(rgb))
        }
        DecodedFrame::Mono16(a) => {
            let input: Vec<u8> = a.iter().flat_map(|v| v.to_le_bytes()).collect();
            let out = demosaic(&input, w, h, BayerDepth::Depth16LE, RasterDepth::Depth16, cfa, 2)?;
            let samples: Vec<u16> = out
                .chunks_exact(2)
                .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
                .collect();
            let rgb = Array3::from_shape_vec((h, w, 3), samples).map_err(shape_err)?;
            Ok(DecodedFrame::Color16(rgb))
        }
        DecodedFrame::Color8(_) | DecodedFrame::Color16(_) => Err(CaptureError::UnsupportedFormat(
            "frame is already 3-channel".into(),
        )),
    }
}

fn demosaic(
    input: &[u8],
    width: usize,
    height: usize,
    depth: BayerDepth,
    raster_depth: RasterDepth,
    cfa: CFA,
    bytes_per_sample: usize,
) -> CaptureResult<Vec<u8>> {
    let mut out = vec![0u8; width * height * 3 * bytes_per_sample];
    let mut raster = RasterMut::new(width, height, raster_depth, &mut out);
    let mut cursor = Cursor::new(input);
    bayer::run_demosaic(&mut cursor, depth, cfa, Demosaic::Linear, &mut raster)
        .map_err(|e| CaptureError::UnsupportedFormat(format!("demosaic failed: {e:?}")))?;
    Ok(out)
}

fn shape_err(e: ndarray::ShapeError) -> CaptureError {
    CaptureError::Buffer(format!("cannot shape debayered frame: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Axis};

    #[test]
    fn pattern_names_round_trip_through_from_str() {
        for p in [
            BayerPattern::None,
            BayerPattern::Rggb,
            BayerPattern::Bggr,
            BayerPattern::Grbg,
            BayerPattern::Gbrg,
        ] {
            assert_eq!(p.as_str().parse::<BayerPattern>().unwrap(), p);
        }
        assert_eq!("rggb".parse::<BayerPattern>().unwrap(), BayerPattern::Rggb);
        assert!("XYZW".parse::<BayerPattern>().is_err());
    }

    #[test]
    fn none_is_passthrough() {
        let frame = DecodedFrame::Mono8(Array2::from_elem((4, 4), 7));
        assert_eq!(debayer(&frame, BayerPattern::None).unwrap(), frame);
    }

    #[test]
    fn uniform_mosaic_stays_uniform() {
        let frame = DecodedFrame::Mono8(Array2::from_elem((8, 8), 120));
        let out = debayer(&frame, BayerPattern::Rggb).unwrap();
        let DecodedFrame::Color8(rgb) = out else {
            panic!("expected Color8");
        };
        assert_eq!(rgb.dim(), (8, 8, 3));
        assert!(rgb.iter().all(|v| *v == 120));
    }

    #[test]
    fn red_sites_land_in_first_channel() {
        // RGGB: red at even row, even column
        let mosaic = Array2::from_shape_fn((8, 8), |(y, x)| {
            if y % 2 == 0 && x % 2 == 0 {
                200u8
            } else {
                0
            }
        });
        let out = debayer(&DecodedFrame::Mono8(mosaic), BayerPattern::Rggb).unwrap();
        let DecodedFrame::Color8(rgb) = out else {
            panic!("expected Color8");
        };
        assert_eq!(rgb[[2, 2, 0]], 200);
        assert_eq!(rgb[[2, 2, 1]], 0);
        assert_eq!(rgb[[2, 2, 2]], 0);
    }

    #[test]
    fn sixteen_bit_keeps_depth() {
        let frame = DecodedFrame::Mono16(Array2::from_elem((4, 6), 40_000));
        let out = debayer(&frame, BayerPattern::Gbrg).unwrap();
        let DecodedFrame::Color16(rgb) = out else {
            panic!("expected Color16");
        };
        assert_eq!(rgb.len_of(Axis(2)), 3);
        assert!(rgb.iter().all(|v| *v == 40_000));
    }

    #[test]
    fn color_and_tiny_frames_are_rejected() {
        let color = DecodedFrame::Color8(Array3::zeros((4, 4, 3)));
        assert!(debayer(&color, BayerPattern::Rggb).is_err());
        let tiny = DecodedFrame::Mono8(Array2::zeros((1, 4)));
        assert!(debayer(&tiny, BayerPattern::Rggb).is_err());
    }
}
