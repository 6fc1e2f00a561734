//! Message types exchanged with the camera worker.
//!
//! The controller and the worker never share state directly. Everything crosses the
//! [`crate::channel`] link as one of two shapes:
//!
//! ```text
//! Controller                           Worker
//! ----------                           ------
//! Command { op, payload }    ------>
//!                                      executes against the device
//!            <------ Envelope { order: "<op>_success" | "error" | "tip", data }
//!            <------ Envelope { order: "preview_frame", data: FrameMessage }
//! ```
//!
//! Responses carry no correlation id. They are matched to requests by their *base* op
//! name only, so [`Response::op`] is `None` for an `error`/`tip` whose payload does not
//! name the op it refers to.
//!
//! Incoming envelopes are converted with [`WorkerMessage::from_envelope`], which never fails:
//! anything it cannot interpret becomes an `error` response instead of a protocol exception.

use crate::session::mode::Roi;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Order name used by the worker for live frames.
pub const PREVIEW_FRAME: &str = "preview_frame";

const SUCCESS_SUFFIX: &str = "_success";

macro_rules! ops {
    ($($(#[$doc:meta])* $variant:ident => $wire:literal,)+) => {
        /// Every operation the controller can ask the worker to perform.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $($(#[$doc])* $variant,)+
        }

        impl Op {
            /// All operations, in declaration order.
            pub const ALL: &'static [Op] = &[$(Op::$variant,)+];

            /// Wire name of the operation.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Op::$variant => $wire,)+
                }
            }

            /// Look up an operation by wire name.
            pub fn parse(name: &str) -> Option<Op> {
                match name {
                    $($wire => Some(Op::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

ops! {
    /// Load the vendor SDK
    InitResource => "init_resource",
    /// List attached cameras
    ReadCameraName => "read_camera_name",
    /// Open a camera by name
    OpenCamera => "open_camera",
    /// Configure readout and stream/capture mode, report capabilities
    InitCamera => "init_camera",
    /// Close the open camera
    CloseCamera => "close_camera",
    /// Ask for the byte size the frame regions must hold
    GetImageBufferSize => "get_image_buffer_size",
    /// Announce the two frame regions to the worker
    SetImageBuffer => "set_image_buffer",
    /// Apply a region of interest
    SetResolution => "set_resolution",
    /// Change hardware binning
    SetCameraPixelBin => "set_camera_pixel_bin",
    /// Change output bit depth
    SetCameraDepth => "set_camera_depth",
    /// Toggle on-device debayering
    UpdateDebayerMode => "update_debayer_mode",
    /// Start live streaming
    StartPreview => "start_preview",
    /// Stop live streaming
    StopPreview => "stop_preview",
    /// Pause (true) or resume (false) live streaming
    SetPreviewPause => "set_preview_pause",
    /// Tell the worker the shape of frames it should publish
    UpdateSharedImageData => "update_shared_image_data",
    SetExposureTime => "set_exposure_time",
    SetGain => "set_gain",
    SetOffset => "set_offset",
    SetUsbTraffic => "set_usb_traffic",
    /// Hardware white balance
    SetWhiteBalance => "set_white_balance",
    GetTemperature => "get_temperature",
    SetTemperature => "set_temperature",
    GetHumidityData => "get_humidity_data",
    /// Move the color filter wheel
    SetCfwFilter => "setCFWFilter",
    SetExternalTrigger => "set_external_trigger",
    StopExternalTrigger => "stop_external_trigger",
    SetBurstMode => "set_burst_mode",
    StartBurstMode => "start_burst_mode",
    SetGpsControl => "set_GPS_control",
    /// Start recording to disk
    StartSaveVideo => "start_save_video",
    StopSaveVideo => "stop_save_video",
    CancelCapture => "cancel_capture",
    /// Capture one frame (SingleShot mode)
    SingleCapture => "singleCapture",
    /// Execute a planned shooting sequence
    RunPlan => "run_plan",
    /// Shut the worker down
    Stop => "stop",
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Op::parse(s).ok_or_else(|| format!("unknown op '{s}'"))
    }
}

/// A request sent to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Operation to perform
    pub op: Op,
    /// Operation arguments
    pub payload: Value,
}

impl Command {
    /// Create a command.
    pub fn new(op: Op, payload: Value) -> Self {
        Self { op, payload }
    }

    /// A command with an empty-string payload, as the worker expects for getters.
    pub fn bare(op: Op) -> Self {
        Self::new(op, Value::String(String::new()))
    }

    /// `set_preview_pause`; `true` pauses, `false` resumes.
    pub fn preview_pause(paused: bool) -> Self {
        Self::new(Op::SetPreviewPause, Value::Bool(paused))
    }

    /// `set_resolution` with `(x, y, w, h)`.
    pub fn set_resolution(roi: Roi) -> Self {
        Self::new(Op::SetResolution, json!([roi.x, roi.y, roi.width, roi.height]))
    }

    /// `update_shared_image_data` with `(w, h, channels, bit_depth)`.
    pub fn update_shared_image(shape: FrameShape) -> Self {
        Self::new(Op::UpdateSharedImageData, shape.to_payload())
    }

    /// Wire form of the command.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            order: self.op.as_str().to_string(),
            data: self.payload.clone(),
        }
    }
}

/// Wire container used in both directions: `{"order": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Op name, suffixed op name, `error`, `tip` or `preview_frame`
    pub order: String,
    /// Payload
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(order: impl Into<String>, data: Value) -> Self {
        Self {
            order: order.into(),
            data,
        }
    }

    /// `<op>_success` envelope.
    pub fn success(op: Op, data: Value) -> Self {
        Self::new(format!("{}{SUCCESS_SUFFIX}", op.as_str()), data)
    }

    /// Parse from JSON text.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Render as JSON text.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// What a response says about its op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Bare op name echoed back
    Ack,
    /// `<op>_success`
    Success,
    /// `error`
    Error,
    /// `tip`, informational
    Tip,
}

/// A decoded, non-frame message from the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Base op, when known
    pub op: Option<Op>,
    /// Success, error or tip
    pub kind: ResponseKind,
    /// Raw payload
    pub payload: Value,
}

impl Response {
    /// A success response for `op`.
    pub fn success(op: Op, payload: Value) -> Self {
        Self {
            op: Some(op),
            kind: ResponseKind::Success,
            payload,
        }
    }

    /// An error response, optionally attributed to an op.
    pub fn error(op: Option<Op>, message: impl Into<String>) -> Self {
        Self {
            op,
            kind: ResponseKind::Error,
            payload: Value::String(message.into()),
        }
    }

    /// Human readable text of an error or tip.
    ///
    /// The worker sends either a bare string or `{"order": ..., "message": ...}`.
    pub fn message(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
            other => other.to_string(),
        }
    }

    fn protocol_error(detail: String) -> Self {
        tracing::warn!(%detail, "malformed worker message");
        Self::error(None, format!("malformed worker message: {detail}"))
    }
}

/// Which of the two shared regions holds a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSelector {
    /// First region, `shm_status = true` on the wire
    Primary,
    /// Second region, `shm_status = false` on the wire
    Secondary,
}

impl BufferSelector {
    /// The other region.
    pub fn flip(self) -> Self {
        match self {
            BufferSelector::Primary => BufferSelector::Secondary,
            BufferSelector::Secondary => BufferSelector::Primary,
        }
    }

    /// Index into a two-element region array.
    pub fn index(self) -> usize {
        match self {
            BufferSelector::Primary => 0,
            BufferSelector::Secondary => 1,
        }
    }
}

impl Serialize for BufferSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(*self == BufferSelector::Primary)
    }
}

impl<'de> Deserialize<'de> for BufferSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(if bool::deserialize(deserializer)? {
            BufferSelector::Primary
        } else {
            BufferSelector::Secondary
        })
    }
}

/// Frame geometry `(width, height, channels, bit_depth)`; a 4-element array on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct FrameShape {
    /// Pixels per row
    pub width: u32,
    /// Rows
    pub height: u32,
    /// 1 (mono / raw Bayer) or 3 (RGB)
    pub channels: u32,
    /// 8 or 16
    pub bit_depth: u32,
}

impl FrameShape {
    /// Create a shape.
    pub fn new(width: u32, height: u32, channels: u32, bit_depth: u32) -> Self {
        Self {
            width,
            height,
            channels,
            bit_depth,
        }
    }

    /// `width * height * channels * bit_depth / 8`
    pub fn byte_size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.channels as usize
            * (self.bit_depth as usize / 8)
    }

    /// JSON array form.
    pub fn to_payload(&self) -> Value {
        json!([self.width, self.height, self.channels, self.bit_depth])
    }
}

impl From<[u32; 4]> for FrameShape {
    fn from(v: [u32; 4]) -> Self {
        FrameShape::new(v[0], v[1], v[2], v[3])
    }
}

impl From<FrameShape> for [u32; 4] {
    fn from(s: FrameShape) -> Self {
        [s.width, s.height, s.channels, s.bit_depth]
    }
}

/// Notification that a frame is ready in one of the shared regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    /// Worker-side frame rate estimate
    pub fps: f64,
    /// Bytes written for this frame
    #[serde(rename = "image_size")]
    pub byte_size: usize,
    /// Declared geometry
    pub shape: FrameShape,
    /// Region holding the bytes
    #[serde(rename = "shm_status")]
    pub buffer_selector: BufferSelector,
    /// Region generation the worker wrote into
    pub generation: u64,
    /// Raw GPS block, when the camera has one
    #[serde(rename = "gps_data", default)]
    pub telemetry: Option<Vec<u8>>,
}

/// Where a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Continuous preview or burst
    Live,
    /// Answer to `singleCapture`
    SingleCapture,
}

/// Anything the worker can send.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Success, error, tip or ack
    Response(Response),
    /// A frame notification
    Frame {
        /// Live or single capture
        origin: FrameOrigin,
        /// Descriptor
        frame: FrameMessage,
    },
}

impl WorkerMessage {
    /// Interpret an envelope. Never fails; malformed input becomes an `error` response.
    pub fn from_envelope(envelope: Envelope) -> Self {
        let Envelope { order, data } = envelope;

        match order.as_str() {
            PREVIEW_FRAME => return Self::frame(FrameOrigin::Live, data),
            "error" | "tip" => {
                let op = data
                    .get("order")
                    .and_then(Value::as_str)
                    .and_then(Op::parse);
                let kind = if order == "error" {
                    ResponseKind::Error
                } else {
                    ResponseKind::Tip
                };
                return WorkerMessage::Response(Response {
                    op,
                    kind,
                    payload: data,
                });
            }
            _ => {}
        }

        if let Some(stem) = order.strip_suffix(SUCCESS_SUFFIX) {
            return match Op::parse(stem) {
                Some(Op::SingleCapture) if data.is_object() => {
                    Self::frame(FrameOrigin::SingleCapture, data)
                }
                Some(op) => WorkerMessage::Response(Response::success(op, data)),
                None => WorkerMessage::Response(Response::protocol_error(format!(
                    "unknown order '{order}'"
                ))),
            };
        }

        match Op::parse(&order) {
            Some(op) => WorkerMessage::Response(Response {
                op: Some(op),
                kind: ResponseKind::Ack,
                payload: data,
            }),
            None => {
                WorkerMessage::Response(Response::protocol_error(format!("unknown order '{order}'")))
            }
        }
    }

    fn frame(origin: FrameOrigin, data: Value) -> Self {
        match serde_json::from_value::<FrameMessage>(data) {
            Ok(frame) => WorkerMessage::Frame { origin, frame },
            Err(e) => WorkerMessage::Response(Response::protocol_error(format!(
                "bad frame payload: {e}"
            ))),
        }
    }
}

/// How a recording decides when to stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordingMode {
    /// Record for a number of seconds
    Duration {
        /// Seconds
        seconds: f64,
    },
    /// Record a fixed number of frames
    FrameCount {
        /// Frames
        frames: u32,
    },
    /// Until `stop_save_video`
    Continuous,
}

/// Arguments of `start_save_video`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingPlan {
    /// Stop condition
    pub mode: RecordingMode,
    /// Output directory
    pub path: String,
    /// Base file name
    pub file_name: String,
    /// Container or image format (`fits`, `tif`, `png`, `avi`, ...)
    pub save_format: String,
    /// Worker-specific save mode label
    pub save_mode: String,
    /// 0-100
    pub jpeg_quality: u8,
    /// TIFF compression label
    pub tiff_compression: String,
    /// Extra FITS header cards
    pub fits_header: Vec<(String, String)>,
}

impl RecordingPlan {
    /// A continuous recording with default encoder settings.
    pub fn continuous(path: impl Into<String>, file_name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            mode: RecordingMode::Continuous,
            path: path.into(),
            file_name: file_name.into(),
            save_format: format.into(),
            save_mode: "single".to_string(),
            jpeg_quality: 100,
            tiff_compression: "None".to_string(),
            fits_header: Vec::new(),
        }
    }

    /// Payload in the worker's flat dictionary layout.
    pub fn to_payload(&self) -> Value {
        let (record_time_mode, record_time) = match self.mode {
            RecordingMode::Duration { seconds } => (true, seconds),
            _ => (false, 0.0),
        };
        let (record_frame_mode, total_frames) = match self.mode {
            RecordingMode::FrameCount { frames } => (true, frames),
            _ => (false, 0),
        };
        let fits_header: Vec<Value> = self
            .fits_header
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect();
        json!({
            "record_time_mode": record_time_mode,
            "record_frame_mode": record_frame_mode,
            "continuous_mode": matches!(self.mode, RecordingMode::Continuous),
            "record_time": record_time,
            "total_frames": total_frames,
            "path": self.path,
            "file_name": self.file_name,
            "save_format": self.save_format,
            "save_mode": self.save_mode,
            "jpeg_quality": self.jpeg_quality,
            "tiff_compression": self.tiff_compression,
            "fits_header": fits_header,
        })
    }
}
