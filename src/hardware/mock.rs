//! Simulated camera worker
//!
//! Speaks the worker side of the command protocol in-process so the controller can run without
//! a camera: it answers the connect handshake, maps the announced frame regions, streams noise
//! frames into alternating regions, and honors pause/resume and geometry changes.
//!
//! Timing uses `tokio::time` only; the worker never blocks its task.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{Duration, MissedTickBehavior};

use crate::channel::WorkerEndpoint;
use crate::data::frame_buffer::{RegionAnnouncement, RegionWriter};
use crate::data::telemetry::TelemetryBlock;
use crate::messages::{BufferSelector, Command, Envelope, FrameMessage, FrameShape, Op};

// =============================================================================
// SimulatedCamera - what the fake sensor reports
// =============================================================================

/// Static description of the simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedCamera {
    /// Name returned by `read_camera_name`
    pub name: String,
    /// Full sensor width
    pub width: u32,
    /// Full sensor height
    pub height: u32,
    /// Bayer sensor
    pub is_color: bool,
    /// Attach a GPS block to every frame
    pub gps: bool,
    /// Live frame period
    pub frame_interval: Duration,
}

impl SimulatedCamera {
    /// Mono sensor streaming at 25 fps.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            name: "SIM-CCD-0001".to_string(),
            width,
            height,
            is_color: false,
            gps: false,
            frame_interval: Duration::from_millis(40),
        }
    }

    /// Report a Bayer sensor with on-device debayer.
    pub fn color(mut self) -> Self {
        self.is_color = true;
        self
    }

    /// Attach a telemetry block to every frame.
    pub fn with_gps(mut self) -> Self {
        self.gps = true;
        self
    }

    /// Time between published frames.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// `init_camera_success` payload.
    pub fn capabilities(&self) -> Value {
        json!({
            "readout_w": self.width,
            "readout_h": self.height,
            "is_color": self.is_color,
            "pixel_bin": {"1*1": [1, 1], "2*2": [2, 2], "4*4": [4, 4]},
            "depth": {"8bit": 8, "16bit": 16},
            "debayer": self.is_color,
            "temperature": true,
            "humidity": true,
            "external_trigger": true,
            "burst_mode": true,
            "GPS_control": self.gps,
        })
    }

    /// Largest frame the sensor can produce (3-channel 8-bit or mono 16-bit).
    fn max_frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

// =============================================================================
// SimulatedWorker - protocol loop
// =============================================================================

/// In-process stand-in for the camera worker.
pub struct SimulatedWorker {
    endpoint: WorkerEndpoint,
    camera: SimulatedCamera,
    writer: Option<RegionWriter>,
    shape: FrameShape,
    selector: BufferSelector,
    streaming: bool,
    paused: bool,
    burst_remaining: u32,
    sequence: u32,
    frames_sent: u64,
    temperature: f64,
}

impl SimulatedWorker {
    /// Worker serving `camera` on the far side of `endpoint`.
    pub fn new(endpoint: WorkerEndpoint, camera: SimulatedCamera) -> Self {
        let shape = FrameShape::new(camera.width, camera.height, 1, 8);
        Self {
            endpoint,
            camera,
            writer: None,
            shape,
            selector: BufferSelector::Primary,
            streaming: false,
            paused: false,
            burst_remaining: 0,
            sequence: 0,
            frames_sent: 0,
            temperature: 20.0,
        }
    }

    /// Frames published so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Shape frames are currently produced in.
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Spawn the worker on the current runtime. Dropping or firing the returned sender stops it.
    pub fn spawn(self) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<u64>>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(self.run(shutdown_rx));
        (shutdown_tx, handle)
    }

    /// Serve commands and stream frames until `stop`, shutdown, or the controller hangs up.
    /// Returns the number of frames published.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<u64> {
        let mut ticker = tokio::time::interval(self.camera.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(camera = %self.camera.name, "simulated worker started");

        loop {
            tokio::select! {
                command = self.endpoint.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("controller hung up");
                        break;
                    };
                    if !self.handle(command)? {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.should_stream() {
                        self.publish_frame()?;
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        tracing::info!(frames = self.frames_sent, "simulated worker stopped");
        Ok(self.frames_sent)
    }

    fn should_stream(&self) -> bool {
        self.writer.is_some() && !self.paused && (self.streaming || self.burst_remaining > 0)
    }

    /// Answer one command. Returns `false` once `stop` has been handled.
    pub fn handle(&mut self, command: Command) -> Result<bool> {
        let Command { op, payload } = command;
        tracing::debug!(%op, "simulated worker command");

        let reply = match op {
            Op::InitResource => Value::Null,
            Op::ReadCameraName => json!([self.camera.name]),
            Op::OpenCamera => {
                if payload.as_str() != Some(self.camera.name.as_str()) {
                    self.endpoint
                        .error(op, format!("no camera named {payload}"));
                    return Ok(true);
                }
                Value::Null
            }
            Op::GetImageBufferSize => json!(self.camera.max_frame_bytes()),
            Op::SetImageBuffer => {
                let announcement = RegionAnnouncement::from_payload(&payload)
                    .ok_or_else(|| anyhow!("malformed set_image_buffer payload: {payload}"))?;
                let writer = RegionWriter::open(&announcement)
                    .with_context(|| format!("mapping regions of generation {}", announcement.generation))?;
                tracing::debug!(generation = writer.generation(), size = writer.capacity(), "regions mapped");
                self.writer = Some(writer);
                Value::Null
            }
            Op::InitCamera => self.camera.capabilities(),
            Op::CloseCamera => {
                self.streaming = false;
                self.writer = None;
                Value::Null
            }
            Op::SetResolution => {
                if let Some([_, _, w, h]) = u32_array::<4>(&payload) {
                    self.shape.width = w;
                    self.shape.height = h;
                }
                Value::Null
            }
            Op::SetCameraDepth => {
                if let Some(bits) = payload.as_u64().and_then(|b| u32::try_from(b).ok()) {
                    self.shape.bit_depth = bits;
                }
                payload
            }
            Op::UpdateDebayerMode => {
                let on = payload.as_bool().unwrap_or(false);
                self.shape.channels = if on && self.camera.is_color { 3 } else { 1 };
                Value::Null
            }
            Op::StartPreview => {
                if let Some([w, h, c, bits]) = u32_array::<4>(&payload) {
                    self.shape = FrameShape::new(w, h, c, bits);
                }
                self.streaming = true;
                self.paused = false;
                Value::Null
            }
            Op::StopPreview => {
                self.streaming = false;
                Value::Null
            }
            Op::SetPreviewPause => {
                self.paused = payload.as_bool().unwrap_or(false);
                payload
            }
            Op::UpdateSharedImageData => {
                if let Some([w, h, c, bits]) = u32_array::<4>(&payload) {
                    self.shape = FrameShape::new(w, h, c, bits);
                }
                Value::Null
            }
            Op::SingleCapture => {
                if let Some([w, h, c, bits]) = u32_array::<4>(&payload) {
                    self.shape = FrameShape::new(w, h, c, bits);
                }
                match self.write_frame()? {
                    Some(frame) => serde_json::to_value(&frame)?,
                    None => {
                        self.endpoint.error(op, "no frame regions mapped");
                        return Ok(true);
                    }
                }
            }
            Op::GetTemperature => {
                self.temperature += rand::thread_rng().gen_range(-0.2..0.2);
                json!(self.temperature)
            }
            Op::SetTemperature => {
                if let Some(t) = payload.as_f64() {
                    self.temperature = t;
                }
                payload
            }
            Op::GetHumidityData => json!(35.0 + rand::thread_rng().gen_range(-1.0..1.0)),
            Op::StartBurstMode => {
                self.burst_remaining = payload
                    .get(2)
                    .and_then(Value::as_u64)
                    .and_then(|m| u32::try_from(m).ok())
                    .unwrap_or(0);
                Value::Null
            }
            Op::StartSaveVideo => {
                self.endpoint.tip("recording to simulated storage");
                Value::Null
            }
            Op::Stop => {
                self.streaming = false;
                self.endpoint.success(op, Value::Null);
                return Ok(false);
            }
            Op::SetCameraPixelBin
            | Op::SetExposureTime
            | Op::SetGain
            | Op::SetOffset
            | Op::SetUsbTraffic
            | Op::SetWhiteBalance
            | Op::SetCfwFilter
            | Op::SetExternalTrigger
            | Op::StopExternalTrigger
            | Op::SetBurstMode
            | Op::SetGpsControl
            | Op::StopSaveVideo
            | Op::CancelCapture
            | Op::RunPlan => payload,
        };

        if !self.endpoint.success(op, reply) {
            tracing::debug!(%op, "controller gone, reply dropped");
            return Ok(false);
        }
        Ok(true)
    }

    /// Write one frame into the next region and announce it.
    pub fn publish_frame(&mut self) -> Result<()> {
        let Some(frame) = self.write_frame()? else {
            return Ok(());
        };
        self.burst_remaining = self.burst_remaining.saturating_sub(1);
        if !self.endpoint.frame(&frame) {
            tracing::debug!("controller gone, frame dropped");
        }
        Ok(())
    }

    fn write_frame(&mut self) -> Result<Option<FrameMessage>> {
        let size = self.shape.byte_size();
        let generation = {
            let Some(writer) = self.writer.as_mut() else {
                return Ok(None);
            };
            if size > writer.capacity() {
                tracing::warn!(size, capacity = writer.capacity(), "frame larger than regions, skipped");
                return Ok(None);
            }
            let mut pixels = vec![0u8; size];
            rand::thread_rng().fill(pixels.as_mut_slice());
            writer.write(self.selector, &pixels)?;
            writer.generation()
        };

        self.sequence = self.sequence.wrapping_add(1);
        let telemetry = self.camera.gps.then(|| self.telemetry_block());
        let frame = FrameMessage {
            fps: 1.0 / self.camera.frame_interval.as_secs_f64().max(1e-3),
            byte_size: size,
            shape: self.shape,
            buffer_selector: self.selector,
            generation,
            telemetry,
        };
        self.selector = self.selector.flip();
        self.frames_sent += 1;
        Ok(Some(frame))
    }

    fn telemetry_block(&self) -> Vec<u8> {
        // 2024-01-01T00:00:00Z counted from the 1995-10-10 epoch
        const BASE: u32 = 891_475_200;
        let start = BASE + self.sequence;
        TelemetryBlock {
            sequence_number: self.sequence,
            width: u16::try_from(self.shape.width).unwrap_or(u16::MAX),
            height: u16::try_from(self.shape.height).unwrap_or(u16::MAX),
            latitude: 404_242_000,
            longitude: 1_000_000_000 + 740_038_000,
            start: (start, 0),
            end: (start, 400_000),
            status: 3,
            now: (start + 1, 0),
            pps_count: self.sequence,
        }
        .to_bytes()
    }

    /// Reply with a raw envelope, for exercising protocol edge cases.
    pub fn send_raw(&self, envelope: Envelope) -> bool {
        self.endpoint.reply(envelope)
    }
}

fn u32_array<const N: usize>(payload: &Value) -> Option<[u32; N]> {
    let items = payload.as_array()?;
    let mut out = [0u32; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = u32::try_from(item.as_u64()?).ok()?;
    }
    (items.len() >= N).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::command_channel;
    use crate::messages::WorkerMessage;

    fn sim() -> (crate::channel::CommandChannel, crate::channel::ResponseStream, SimulatedWorker) {
        let (channel, responses, endpoint) = command_channel();
        let worker = SimulatedWorker::new(endpoint, SimulatedCamera::new(32, 16).with_gps());
        (channel, responses, worker)
    }

    #[test]
    fn answers_the_handshake() {
        let (_channel, mut responses, mut worker) = sim();
        assert!(worker.handle(Command::bare(Op::ReadCameraName)).unwrap());
        assert!(worker.handle(Command::bare(Op::InitCamera)).unwrap());

        let Some(WorkerMessage::Response(names)) = responses.try_recv() else {
            panic!("expected a response");
        };
        assert_eq!(names.payload, json!(["SIM-CCD-0001"]));
        let Some(WorkerMessage::Response(caps)) = responses.try_recv() else {
            panic!("expected a response");
        };
        assert_eq!(caps.payload["readout_w"], json!(32));
    }

    #[test]
    fn wrong_camera_name_is_an_error() {
        let (_channel, mut responses, mut worker) = sim();
        worker
            .handle(Command::new(Op::OpenCamera, json!("other")))
            .unwrap();
        let Some(WorkerMessage::Response(r)) = responses.try_recv() else {
            panic!("expected a response");
        };
        assert_eq!(r.op, Some(Op::OpenCamera));
        assert!(r.message().contains("other"));
    }

    #[test]
    fn pause_ack_echoes_flag() {
        let (_channel, mut responses, mut worker) = sim();
        worker.handle(Command::preview_pause(true)).unwrap();
        assert!(!worker.should_stream());
        let Some(WorkerMessage::Response(r)) = responses.try_recv() else {
            panic!("expected a response");
        };
        assert_eq!(r.payload, json!(true));
    }

    #[test]
    fn reshape_follows_update_shared_image_data() {
        let (_channel, _responses, mut worker) = sim();
        worker
            .handle(Command::update_shared_image(FrameShape::new(8, 4, 1, 16)))
            .unwrap();
        assert_eq!(worker.shape(), FrameShape::new(8, 4, 1, 16));
    }

    #[test]
    fn stop_ends_the_loop() {
        let (_channel, _responses, mut worker) = sim();
        assert!(!worker.handle(Command::bare(Op::Stop)).unwrap());
    }

    #[test]
    fn u32_array_requires_enough_items() {
        assert_eq!(u32_array::<2>(&json!([1, 2, 3])), Some([1, 2]));
        assert_eq!(u32_array::<4>(&json!([1, 2])), None);
        assert_eq!(u32_array::<1>(&json!(["x"])), None);
    }
}
