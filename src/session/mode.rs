//! Session geometry and mode types.

use crate::error::{CaptureError, CaptureResult};
use crate::messages::FrameShape;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Top-level streaming state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamingMode {
    /// No camera
    Disconnected,
    /// Connected, nothing streaming
    Idle,
    /// Live frames via preview subscription
    Continuous,
    /// One capture request per exposure
    SingleShot,
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamingMode::Disconnected => "Disconnected",
            StreamingMode::Idle => "Idle",
            StreamingMode::Continuous => "Continuous",
            StreamingMode::SingleShot => "SingleShot",
        };
        f.write_str(name)
    }
}

/// Region of interest in binned sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl Roi {
    /// Create a ROI.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// ROI covering a whole `width x height` area.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Fit the ROI inside the sensor and align it to even coordinates.
    ///
    /// Width and height are shrunk so the ROI ends at the sensor edge (the origin is never
    /// moved), then all four fields are rounded up to the next even number. If rounding pushes
    /// the ROI past an even-sized sensor edge again, the extent gives back two pixels.
    pub fn normalize(self, sensor_width: u32, sensor_height: u32) -> Roi {
        let mut roi = self;
        if roi.x.saturating_add(roi.width) > sensor_width {
            roi.width = sensor_width.saturating_sub(roi.x);
        }
        if roi.y.saturating_add(roi.height) > sensor_height {
            roi.height = sensor_height.saturating_sub(roi.y);
        }

        roi.x = round_up_even(roi.x);
        roi.y = round_up_even(roi.y);
        roi.width = round_up_even(roi.width);
        roi.height = round_up_even(roi.height);

        while roi.width > 0 && roi.x + roi.width > sensor_width {
            roi.width -= 2;
        }
        while roi.height > 0 && roi.y + roi.height > sensor_height {
            roi.height -= 2;
        }
        roi
    }

    /// Zero width or height.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

fn round_up_even(v: u32) -> u32 {
    v.saturating_add(v & 1)
}

/// Hardware binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bin {
    /// Horizontal factor
    pub x: u32,
    /// Vertical factor
    pub y: u32,
}

impl Bin {
    /// No binning.
    pub const ONE: Bin = Bin { x: 1, y: 1 };

    /// Create a bin.
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Parse the worker's `"2*2"` label.
    pub fn parse_label(label: &str) -> Option<Bin> {
        let (x, y) = label.split_once('*')?;
        let x = x.trim().parse().ok()?;
        let y = y.trim().parse().ok()?;
        (x > 0 && y > 0).then_some(Bin { x, y })
    }

    /// `"2*2"`
    pub fn label(&self) -> String {
        format!("{}*{}", self.x, self.y)
    }
}

/// Output sample depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    /// u8 samples
    Eight,
    /// u16 little-endian samples
    Sixteen,
}

impl BitDepth {
    /// From a bit count.
    pub fn from_bits(bits: u32) -> Option<BitDepth> {
        match bits {
            8 => Some(BitDepth::Eight),
            16 => Some(BitDepth::Sixteen),
            _ => None,
        }
    }

    /// 8 or 16
    pub fn bits(self) -> u32 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }

    /// 1 or 2
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// 255 or 65535
    pub fn max_value(self) -> u32 {
        match self {
            BitDepth::Eight => 255,
            BitDepth::Sixteen => 65535,
        }
    }
}

/// What the connected camera reports it can do (`init_camera_success` payload).
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Unbinned readout width
    pub sensor_width: u32,
    /// Unbinned readout height
    pub sensor_height: u32,
    /// Bayer sensor
    pub is_color: bool,
    /// Supported binning, in worker order
    pub bins: Vec<Bin>,
    /// Supported depths, in worker order
    pub bit_depths: Vec<BitDepth>,
    /// On-device debayer available
    pub debayer: bool,
    /// Sensor cooling
    pub temperature_control: bool,
    /// Humidity sensor
    pub humidity: bool,
    /// Filter wheel attached
    pub filter_wheel: bool,
    /// Device-side auto exposure
    pub auto_exposure: bool,
    /// Device-side auto white balance
    pub auto_white_balance: bool,
    /// Hardware trigger input
    pub external_trigger: bool,
    /// Burst capture supported
    pub burst_mode: bool,
    /// GPS module; frames carry telemetry blocks
    pub gps: bool,
}

impl Capabilities {
    /// Parse the `init_camera_success` payload.
    ///
    /// `readout_w`, `readout_h`, `is_color`, `pixel_bin` and `depth` are required; feature flags
    /// default to off.
    pub fn from_payload(data: &Value) -> CaptureResult<Self> {
        let dim = |key: &str| -> CaptureResult<u32> {
            data.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| CaptureError::Protocol(format!("init_camera: missing '{key}'")))
        };

        let bins: Vec<Bin> = match data.get("pixel_bin") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(label, v)| {
                    let pair = v.as_array()?;
                    let x = u32::try_from(pair.first()?.as_u64()?).ok()?;
                    let y = u32::try_from(pair.get(1)?.as_u64()?).ok()?;
                    Bin::parse_label(label).filter(|b| b.x == x && b.y == y)
                })
                .collect(),
            Some(Value::Array(labels)) => labels
                .iter()
                .filter_map(|v| v.as_str().and_then(Bin::parse_label))
                .collect(),
            _ => Vec::new(),
        };
        if bins.is_empty() {
            return Err(CaptureError::Protocol(
                "init_camera: no usable 'pixel_bin' entries".into(),
            ));
        }

        let bit_depths: Vec<BitDepth> = match data.get("depth") {
            Some(Value::Object(map)) => map
                .values()
                .filter_map(|v| v.as_u64().and_then(|b| BitDepth::from_bits(b as u32)))
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_u64().and_then(|b| BitDepth::from_bits(b as u32)))
                .collect(),
            _ => Vec::new(),
        };
        if bit_depths.is_empty() {
            return Err(CaptureError::Protocol(
                "init_camera: no usable 'depth' entries".into(),
            ));
        }

        let is_color = data
            .get("is_color")
            .and_then(Value::as_bool)
            .ok_or_else(|| CaptureError::Protocol("init_camera: missing 'is_color'".into()))?;

        Ok(Self {
            sensor_width: dim("readout_w")?,
            sensor_height: dim("readout_h")?,
            is_color,
            bins,
            bit_depths,
            debayer: flag(data.get("debayer")),
            temperature_control: flag(data.get("temperature")),
            humidity: flag(data.get("humidity")),
            filter_wheel: flag(data.get("CFW")),
            auto_exposure: flag(data.get("auto_exposure")),
            auto_white_balance: flag(data.get("auto_white_balance")),
            external_trigger: flag(data.get("external_trigger")),
            burst_mode: flag(data.get("burst_mode")),
            gps: flag(data.get("GPS_control")),
        })
    }
}

/// Feature flags arrive as bools, `[available, details]` pairs or non-empty maps.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Array(items)) => flag(items.first()),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

/// Exposure controls mirrored from the last successful set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSettings {
    /// Milliseconds
    pub exposure_ms: f64,
    pub gain: f64,
    pub offset: f64,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            gain: 0.0,
            offset: 0.0,
        }
    }
}

/// Device and session geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeState {
    /// Unbinned sensor width
    pub sensor_width: u32,
    /// Unbinned sensor height
    pub sensor_height: u32,
    /// Current binning
    pub bin: Bin,
    /// Readout region, in binned pixels
    pub roi: Roi,
    /// Pixel depth of published frames
    pub bit_depth: BitDepth,
    /// Frames arrive debayered to RGB
    pub debayer_enabled: bool,
    /// Copied from the capabilities at connect
    pub is_color_sensor: bool,
    /// Where live frames go
    pub streaming_mode: StreamingMode,
}

impl ModeState {
    /// Geometry right after connect: full sensor, first supported bin and depth, no debayer.
    pub fn from_capabilities(caps: &Capabilities) -> Self {
        let bin = if caps.bins.contains(&Bin::ONE) {
            Bin::ONE
        } else {
            caps.bins.first().copied().unwrap_or(Bin::ONE)
        };
        let bit_depth = if caps.bit_depths.contains(&BitDepth::Eight) {
            BitDepth::Eight
        } else {
            caps.bit_depths.first().copied().unwrap_or(BitDepth::Eight)
        };
        let mut state = Self {
            sensor_width: caps.sensor_width,
            sensor_height: caps.sensor_height,
            bin,
            roi: Roi::full(0, 0),
            bit_depth,
            debayer_enabled: false,
            is_color_sensor: caps.is_color,
            streaming_mode: StreamingMode::Idle,
        };
        state.roi = state.full_roi();
        state
    }

    /// Sensor width after binning.
    pub fn binned_width(&self) -> u32 {
        self.sensor_width / self.bin.x.max(1)
    }

    /// Sensor height after binning.
    pub fn binned_height(&self) -> u32 {
        self.sensor_height / self.bin.y.max(1)
    }

    /// ROI covering the whole binned sensor.
    pub fn full_roi(&self) -> Roi {
        Roi::full(self.binned_width(), self.binned_height())
    }

    /// 3 when the device debayers a color sensor, else 1.
    pub fn channels(&self) -> u32 {
        if self.is_color_sensor && self.debayer_enabled {
            3
        } else {
            1
        }
    }

    /// Shape of the frames the worker should publish.
    pub fn frame_shape(&self) -> FrameShape {
        FrameShape::new(
            self.roi.width,
            self.roi.height,
            self.channels(),
            self.bit_depth.bits(),
        )
    }

    /// Bytes per frame in the current geometry.
    pub fn frame_bytes(&self) -> usize {
        self.frame_shape().byte_size()
    }

    /// On-device debayer needs a color sensor at 1x1 binning and 8-bit output.
    pub fn debayer_allowed(&self) -> bool {
        self.is_color_sensor && self.bin == Bin::ONE && self.bit_depth == BitDepth::Eight
    }
}
