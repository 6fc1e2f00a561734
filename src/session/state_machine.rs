//! Session state machine: connect handshake, streaming mode, and geometry reconfiguration.
//!
//! ```text
//!  Disconnected --connect--> Connecting --init_camera_success--> Connected
//!       ^                        |                                   |
//!       +---- error / timeout ---+                                   |
//!       +------------------------- disconnect -----------------------+
//!
//!  Connected:  Idle <--> SingleShot        Idle/SingleShot --start_preview--> Continuous
//! ```
//!
//! A geometry change (ROI, binning, bit depth, debayer) while Continuous runs as
//!
//! ```text
//! set_preview_pause(true) -> ack -> op... -> ack -> allocate regions -> set_image_buffer
//!     -> update_shared_image_data -> set_preview_pause(false)
//! ```
//!
//! Outside Continuous the pause steps are skipped. Only one reconfiguration or mode switch
//! may be pending at a time; further requests are refused with a state error, never queued.
//! The [`Quiesced`] token handed to [`FrameBufferPool::allocate`] is only minted here, after a
//! pause acknowledgment or when nothing is streaming.
//!
//! Events for collaborators go out through [`ModeStateMachine::subscribe`].

use crate::channel::CommandChannel;
use crate::config::{AppConfig, BufferConfig, SessionConfig};
use crate::data::frame_buffer::{FrameBufferPool, Quiesced};
use crate::data::mailbox::FrameMailbox;
use crate::error::{CaptureError, CaptureResult};
use crate::messages::{
    Command, FrameMessage, FrameOrigin, Op, RecordingPlan, Response, ResponseKind, WorkerMessage,
};
use crate::session::mode::{
    Bin, BitDepth, Capabilities, ExposureSettings, ModeState, Roi, StreamingMode,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Something the UI (or another collaborator) asks the session to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Start the connect handshake; `None` picks the first camera found
    Connect {
        /// Camera to open
        camera: Option<String>,
    },
    /// Close the camera and release the frame regions
    Disconnect,
    /// Switch between Idle, Continuous and SingleShot
    SelectMode(StreamingMode),
    /// Apply a region of interest (binned pixels)
    ApplyRoi(Roi),
    /// Go back to the full binned sensor
    ResetRoi,
    /// Change hardware binning
    SetBin(Bin),
    /// Change output depth
    SetBitDepth(BitDepth),
    /// Toggle on-device debayer
    SetDebayer(bool),
    /// Exposure time, milliseconds
    SetExposure(f64),
    SetGain(f64),
    SetOffset(f64),
    SetUsbTraffic(u32),
    /// Hardware white balance slider positions
    SetWhiteBalance {
        red: u32,
        green: u32,
        blue: u32,
    },
    /// Cooler target, degrees C
    SetTemperature(f64),
    PollTemperature,
    PollHumidity,
    /// Move the filter wheel to a slot
    SetFilterWheel(String),
    SetExternalTrigger {
        /// Trigger interface name
        interface: String,
        /// Drive the trigger output too
        use_output: bool,
    },
    StopExternalTrigger,
    SetBurstMode {
        enabled: bool,
        min: u32,
        max: u32,
    },
    StartBurst {
        min: u32,
        max: u32,
    },
    SetGpsControl(bool),
    StartRecording(RecordingPlan),
    StopRecording,
    /// One exposure in SingleShot mode
    SingleCapture,
    CancelCapture,
    /// Hand a shooting plan to the worker
    RunPlan(Value),
    /// Disconnect if needed and stop the worker
    Shutdown,
}

/// Notifications for collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake finished
    Connected {
        /// Opened camera
        camera: String,
        /// What it reported
        capabilities: Capabilities,
        /// Starting geometry
        mode: ModeState,
    },
    /// Handshake failed; the session is Disconnected again
    ConnectFailed {
        /// Cause
        reason: String,
    },
    Disconnected,
    /// Streaming mode committed
    ModeChanged(StreamingMode),
    /// Mode switch refused by the worker or timed out
    ModeChangeFailed {
        /// Cause
        reason: String,
    },
    /// New geometry committed
    GeometryChanged(ModeState),
    /// Reconfiguration abandoned; the previous geometry is still in effect
    ReconfigurationFailed {
        /// Cause
        reason: String,
    },
    /// Regions (re)created and announced
    BuffersAllocated {
        /// Generation frames must carry
        generation: u64,
        /// Bytes per region
        size: usize,
    },
    ExposureChanged(ExposureSettings),
    /// Sensor temperature, degrees C
    Temperature(f64),
    /// Relative humidity, percent
    Humidity(f64),
    RecordingStarted,
    RecordingStopped,
    CaptureCancelled,
    /// Informational message from the worker
    Tip(String),
    /// Error reported by the worker
    DeviceError {
        /// Op the error refers to, when known
        op: Option<Op>,
        /// Worker text
        message: String,
    },
    /// Success of an op with no dedicated event
    OperationSucceeded {
        /// Op
        op: Op,
        /// Worker payload
        payload: Value,
    },
}

/// Steps of the connect handshake, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Waiting for `init_resource_success`
    InitResource,
    /// Waiting for the camera list
    ReadCameraName,
    /// Waiting for `open_camera_success`
    OpenCamera,
    /// Waiting for the required region size
    BufferSize,
    /// Waiting for capabilities
    InitCamera,
}

impl HandshakeStep {
    /// Op whose success completes this step.
    pub fn op(self) -> Op {
        match self {
            HandshakeStep::InitResource => Op::InitResource,
            HandshakeStep::ReadCameraName => Op::ReadCameraName,
            HandshakeStep::OpenCamera => Op::OpenCamera,
            HandshakeStep::BufferSize => Op::GetImageBufferSize,
            HandshakeStep::InitCamera => Op::InitCamera,
        }
    }
}

#[derive(Debug)]
struct Handshake {
    step: HandshakeStep,
    requested: Option<String>,
    camera: Option<String>,
    opened: bool,
    pool: FrameBufferPool,
    deadline: Instant,
}

enum HandshakeOutcome {
    Advanced,
    Failed(String),
    Complete(Capabilities),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconfigKind {
    Roi,
    Bin,
    BitDepth,
    Debayer,
}

impl fmt::Display for ReconfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconfigKind::Roi => "roi",
            ReconfigKind::Bin => "bin",
            ReconfigKind::BitDepth => "bit_depth",
            ReconfigKind::Debayer => "debayer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingPause,
    AwaitingOp(Op),
}

#[derive(Debug)]
struct Reconfiguration {
    kind: ReconfigKind,
    target: ModeState,
    steps: VecDeque<Command>,
    stage: Stage,
    paused: bool,
    deadline: Instant,
}

#[derive(Debug)]
enum Pending {
    Reconfigure(Reconfiguration),
    ModeSwitch {
        target: StreamingMode,
        deadline: Instant,
    },
}

impl Pending {
    fn describe(&self) -> String {
        match self {
            Pending::Reconfigure(rc) => format!("{} reconfiguration", rc.kind),
            Pending::ModeSwitch { target, .. } => format!("switch to {target}"),
        }
    }
}

/// Everything that exists only while a camera is connected.
#[derive(Debug)]
pub struct SessionContext {
    camera_name: String,
    capabilities: Capabilities,
    mode: ModeState,
    exposure: ExposureSettings,
    requested_exposure: ExposureSettings,
    pool: FrameBufferPool,
    recording: bool,
    capture_in_progress: bool,
    burst_active: bool,
    trigger_active: bool,
    pending: Option<Pending>,
    stale_pause_acks: u32,
}

/// Borrowed pieces of the machine a session needs to act.
struct Wiring<'a> {
    channel: &'a mut CommandChannel,
    mailbox: &'a FrameMailbox,
    events: &'a mut Vec<SessionEvent>,
    config: &'a SessionConfig,
}

enum Phase {
    Disconnected,
    Connecting(Box<Handshake>),
    Connected(Box<SessionContext>),
}

/// Owner of the session state, the command channel and the frame regions.
pub struct ModeStateMachine {
    session_config: SessionConfig,
    buffer_config: BufferConfig,
    channel: CommandChannel,
    mailbox: Arc<FrameMailbox>,
    phase: Phase,
    /// Highest region generation handed out so far, carried across sessions
    last_generation: u64,
    events: Vec<SessionEvent>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl ModeStateMachine {
    /// A disconnected machine sending through `channel`.
    pub fn new(config: &AppConfig, channel: CommandChannel) -> Self {
        Self {
            session_config: config.session.clone(),
            buffer_config: config.buffers.clone(),
            channel,
            mailbox: Arc::new(FrameMailbox::new(config.session.mailbox_capacity)),
            phase: Phase::Disconnected,
            last_generation: 0,
            events: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Current streaming mode; `Disconnected` until the handshake completes.
    pub fn streaming_mode(&self) -> StreamingMode {
        match &self.phase {
            Phase::Connected(ctx) => ctx.mode.streaming_mode,
            _ => StreamingMode::Disconnected,
        }
    }

    /// Handshake step being awaited, if connecting.
    pub fn handshake_step(&self) -> Option<HandshakeStep> {
        match &self.phase {
            Phase::Connecting(hs) => Some(hs.step),
            _ => None,
        }
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<&SessionContext> {
        match &self.phase {
            Phase::Connected(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Drop-oldest mailbox live frames are published into.
    pub fn mailbox(&self) -> &Arc<FrameMailbox> {
        &self.mailbox
    }

    /// Command channel, for availability checks and the command log.
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Bytes of an announced frame, validated against the current generation and shape.
    pub fn consume(&self, frame: &FrameMessage) -> CaptureResult<&[u8]> {
        match &self.phase {
            Phase::Connected(ctx) => ctx.pool.consume(frame),
            _ => Err(CaptureError::Buffer("no session, frame regions are gone".into())),
        }
    }

    /// Apply a control request. Requests invalid in the current state fail with
    /// [`CaptureError::State`] and send nothing.
    pub fn handle_request(&mut self, request: ControlRequest) -> CaptureResult<()> {
        tracing::debug!(?request, state = %self.describe(), "control request");
        let result = match request {
            ControlRequest::Connect { camera } => self.begin_connect(camera),
            ControlRequest::Disconnect => self.end_session(),
            ControlRequest::Shutdown => self.shutdown(),
            other => self
                .connected()
                .and_then(|(ctx, mut io)| ctx.apply(other, &mut io)),
        };
        self.flush();
        result
    }

    /// Start the connect handshake.
    pub fn connect(&mut self, camera: Option<String>) -> CaptureResult<()> {
        self.handle_request(ControlRequest::Connect { camera })
    }

    /// Close the camera.
    pub fn disconnect(&mut self) -> CaptureResult<()> {
        self.handle_request(ControlRequest::Disconnect)
    }

    /// Switch streaming mode.
    pub fn select_mode(&mut self, mode: StreamingMode) -> CaptureResult<()> {
        self.handle_request(ControlRequest::SelectMode(mode))
    }

    /// Apply a region of interest.
    pub fn apply_roi(&mut self, roi: Roi) -> CaptureResult<()> {
        self.handle_request(ControlRequest::ApplyRoi(roi))
    }

    /// Change binning.
    pub fn set_bin(&mut self, bin: Bin) -> CaptureResult<()> {
        self.handle_request(ControlRequest::SetBin(bin))
    }

    /// Change output depth.
    pub fn set_bit_depth(&mut self, depth: BitDepth) -> CaptureResult<()> {
        self.handle_request(ControlRequest::SetBitDepth(depth))
    }

    /// Toggle on-device debayer.
    pub fn set_debayer(&mut self, enabled: bool) -> CaptureResult<()> {
        self.handle_request(ControlRequest::SetDebayer(enabled))
    }

    /// Feed any worker message. Returns single-capture frames, which bypass the mailbox.
    pub fn handle_message(&mut self, message: WorkerMessage) -> Option<FrameMessage> {
        match message {
            WorkerMessage::Response(response) => {
                self.handle_response(response);
                None
            }
            WorkerMessage::Frame { origin, frame } => self.on_frame(origin, frame),
        }
    }

    /// Interpret a non-frame worker message.
    pub fn handle_response(&mut self, response: Response) {
        if matches!(self.phase, Phase::Connecting(_)) {
            self.advance_handshake(response);
        } else if let Ok((ctx, mut io)) = self.connected() {
            ctx.on_response(response, &mut io);
        } else {
            match response.kind {
                ResponseKind::Tip => self.events.push(SessionEvent::Tip(response.message())),
                ResponseKind::Error => self.events.push(SessionEvent::DeviceError {
                    op: response.op,
                    message: response.message(),
                }),
                ResponseKind::Success | ResponseKind::Ack => {
                    tracing::debug!(op = ?response.op, "response without session ignored");
                }
            }
        }
        self.flush();
    }

    /// Route a frame notification. Live frames go to the mailbox while streaming; a single
    /// capture is returned for immediate processing.
    pub fn on_frame(&mut self, origin: FrameOrigin, frame: FrameMessage) -> Option<FrameMessage> {
        let out = match self.connected() {
            Ok((ctx, mut io)) => ctx.on_frame(origin, frame, &mut io),
            Err(_) => {
                tracing::trace!(generation = frame.generation, "frame without session dropped");
                None
            }
        };
        self.flush();
        out
    }

    /// Expire overdue handshake steps, pause acknowledgments and responses.
    pub fn tick(&mut self, now: Instant) {
        let overdue = match &self.phase {
            Phase::Connecting(hs) if now >= hs.deadline => Some(hs.step.op()),
            _ => None,
        };
        if let Some(op) = overdue {
            self.fail_connect(CaptureError::Timeout(op.to_string()).to_string());
        } else if let Ok((ctx, mut io)) = self.connected() {
            ctx.tick(now, &mut io);
        }
        self.flush();
    }

    fn describe(&self) -> String {
        match &self.phase {
            Phase::Disconnected => "Disconnected".to_string(),
            Phase::Connecting(hs) => format!("Connecting({:?})", hs.step),
            Phase::Connected(ctx) => ctx.mode.streaming_mode.to_string(),
        }
    }

    fn connected(&mut self) -> CaptureResult<(&mut SessionContext, Wiring<'_>)> {
        let Self {
            phase,
            channel,
            mailbox,
            events,
            session_config,
            ..
        } = self;
        match phase {
            Phase::Connected(ctx) => Ok((
                ctx.as_mut(),
                Wiring {
                    channel,
                    mailbox: &**mailbox,
                    events,
                    config: session_config,
                },
            )),
            Phase::Connecting(hs) => Err(CaptureError::state(
                format!("Connecting({:?})", hs.step),
                "handshake in progress",
            )),
            Phase::Disconnected => Err(CaptureError::state(
                StreamingMode::Disconnected,
                "no camera connected",
            )),
        }
    }

    fn flush(&mut self) {
        if self.events.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| !tx.is_closed());
        for event in self.events.drain(..) {
            for tx in &self.subscribers {
                let _ = tx.send(event.clone());
            }
        }
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    fn begin_connect(&mut self, camera: Option<String>) -> CaptureResult<()> {
        if !matches!(self.phase, Phase::Disconnected) {
            return Err(CaptureError::state(
                self.describe(),
                "already connected or connecting",
            ));
        }
        if !self.channel.is_available() {
            return Err(CaptureError::ChannelUnavailable {
                op: Op::InitResource.to_string(),
            });
        }

        let pool = FrameBufferPool::new(
            self.buffer_config.shm_dir.clone(),
            self.buffer_config.region_prefix.clone(),
        )
        .continuing_from(self.last_generation);
        self.channel.send(
            Op::InitResource,
            Value::String(self.session_config.sdk_path.clone()),
        );
        tracing::info!(camera = ?camera, "connecting");
        self.phase = Phase::Connecting(Box::new(Handshake {
            step: HandshakeStep::InitResource,
            requested: camera,
            camera: None,
            opened: false,
            pool,
            deadline: Instant::now() + self.session_config.response_timeout(),
        }));
        Ok(())
    }

    fn advance_handshake(&mut self, response: Response) {
        let outcome = {
            let Self {
                phase,
                channel,
                events,
                session_config,
                ..
            } = self;
            let Phase::Connecting(hs) = phase else {
                return;
            };
            match response.kind {
                ResponseKind::Error => HandshakeOutcome::Failed(format!(
                    "{} failed: {}",
                    response.op.unwrap_or(hs.step.op()),
                    response.message()
                )),
                ResponseKind::Tip => {
                    events.push(SessionEvent::Tip(response.message()));
                    return;
                }
                ResponseKind::Ack => return,
                ResponseKind::Success if response.op != Some(hs.step.op()) => {
                    tracing::debug!(op = ?response.op, step = ?hs.step, "not awaited during handshake");
                    return;
                }
                ResponseKind::Success => {
                    handshake_step(hs, &response.payload, channel, events, session_config)
                }
            }
        };

        match outcome {
            HandshakeOutcome::Advanced => {}
            HandshakeOutcome::Failed(reason) => self.fail_connect(reason),
            HandshakeOutcome::Complete(caps) => self.finish_connect(caps),
        }
    }

    fn fail_connect(&mut self, reason: String) {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Connecting(hs) => {
                self.last_generation = self.last_generation.max(hs.pool.generation());
                if hs.opened {
                    self.channel.send(Op::CloseCamera, Value::Bool(true));
                }
                tracing::error!(%reason, step = ?hs.step, "connect failed, back to Disconnected");
                self.events.push(SessionEvent::ConnectFailed { reason });
            }
            other => self.phase = other,
        }
    }

    fn finish_connect(&mut self, capabilities: Capabilities) {
        let hs = match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Connecting(hs) => hs,
            other => {
                self.phase = other;
                return;
            }
        };

        let mode = ModeState::from_capabilities(&capabilities);
        let camera_name = hs.camera.unwrap_or_default();
        tracing::info!(
            camera = %camera_name,
            width = mode.sensor_width,
            height = mode.sensor_height,
            color = mode.is_color_sensor,
            "camera connected"
        );
        self.events.push(SessionEvent::Connected {
            camera: camera_name.clone(),
            capabilities: capabilities.clone(),
            mode: mode.clone(),
        });
        self.phase = Phase::Connected(Box::new(SessionContext {
            camera_name,
            capabilities,
            mode,
            exposure: ExposureSettings::default(),
            requested_exposure: ExposureSettings::default(),
            pool: hs.pool,
            recording: false,
            capture_in_progress: false,
            burst_active: false,
            trigger_active: false,
            pending: None,
            stale_pause_acks: 0,
        }));

        let initial = self.session_config.initial_mode;
        if matches!(initial, StreamingMode::Continuous | StreamingMode::SingleShot) {
            if let Err(e) = self
                .connected()
                .and_then(|(ctx, mut io)| ctx.select_mode(initial, &mut io))
            {
                tracing::warn!(error = %e, mode = %initial, "initial mode not entered");
            }
        }
    }

    fn end_session(&mut self) -> CaptureResult<()> {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Disconnected => Err(CaptureError::state(
                StreamingMode::Disconnected,
                "not connected",
            )),
            Phase::Connecting(hs) => {
                self.last_generation = self.last_generation.max(hs.pool.generation());
                if hs.opened {
                    self.channel.send(Op::CloseCamera, Value::Bool(true));
                }
                tracing::info!(step = ?hs.step, "connect abandoned");
                self.events.push(SessionEvent::Disconnected);
                Ok(())
            }
            Phase::Connected(ctx) => {
                self.last_generation = self.last_generation.max(ctx.pool.generation());
                if ctx.recording {
                    self.channel.send_command(Command::bare(Op::StopSaveVideo));
                }
                if ctx.mode.streaming_mode == StreamingMode::Continuous {
                    self.channel.send_command(Command::bare(Op::StopPreview));
                }
                let dropped = self.mailbox.discard_pending();
                self.channel.send(Op::CloseCamera, Value::Bool(true));
                tracing::info!(camera = %ctx.camera_name, dropped, "disconnected");
                drop(ctx);
                self.events.push(SessionEvent::Disconnected);
                Ok(())
            }
        }
    }

    fn shutdown(&mut self) -> CaptureResult<()> {
        if !matches!(self.phase, Phase::Disconnected) {
            self.end_session()?;
        }
        self.channel.send_command(Command::bare(Op::Stop));
        self.channel.close();
        tracing::info!("worker stop requested");
        Ok(())
    }
}

fn handshake_step(
    hs: &mut Handshake,
    payload: &Value,
    channel: &mut CommandChannel,
    events: &mut Vec<SessionEvent>,
    config: &SessionConfig,
) -> HandshakeOutcome {
    let next = match hs.step {
        HandshakeStep::InitResource => {
            channel.send_command(Command::bare(Op::ReadCameraName));
            HandshakeStep::ReadCameraName
        }
        HandshakeStep::ReadCameraName => {
            let names = camera_names(payload);
            let chosen = match &hs.requested {
                Some(wanted) => names.iter().find(|n| *n == wanted).cloned(),
                None => names.first().cloned(),
            };
            let Some(name) = chosen else {
                return HandshakeOutcome::Failed(match &hs.requested {
                    Some(wanted) if !names.is_empty() => format!("camera '{wanted}' not found"),
                    _ => "no camera found".to_string(),
                });
            };
            tracing::debug!(camera = %name, found = names.len(), "camera selected");
            channel.send(Op::OpenCamera, Value::String(name.clone()));
            hs.camera = Some(name);
            HandshakeStep::OpenCamera
        }
        HandshakeStep::OpenCamera => {
            hs.opened = true;
            channel.send_command(Command::bare(Op::GetImageBufferSize));
            HandshakeStep::BufferSize
        }
        HandshakeStep::BufferSize => {
            let Some(size) = payload
                .as_u64()
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
            else {
                return HandshakeOutcome::Failed(format!("invalid image buffer size {payload}"));
            };
            match hs.pool.allocate(size, &Quiesced::not_streaming()) {
                Ok(announcement) => {
                    channel.send(Op::SetImageBuffer, announcement.to_payload());
                    events.push(SessionEvent::BuffersAllocated {
                        generation: announcement.generation,
                        size: announcement.size,
                    });
                }
                Err(e) => return HandshakeOutcome::Failed(format!("frame regions: {e}")),
            }
            let mode_label = match config.initial_mode {
                StreamingMode::Continuous => "Continuous",
                _ => "SingleShot",
            };
            channel.send(
                Op::InitCamera,
                json!([hs.camera.clone().unwrap_or_default(), config.readout_mode, mode_label]),
            );
            HandshakeStep::InitCamera
        }
        HandshakeStep::InitCamera => {
            return match Capabilities::from_payload(payload) {
                Ok(caps) => HandshakeOutcome::Complete(caps),
                Err(e) => HandshakeOutcome::Failed(e.to_string()),
            };
        }
    };
    hs.step = next;
    hs.deadline = Instant::now() + config.response_timeout();
    HandshakeOutcome::Advanced
}

fn camera_names(payload: &Value) -> Vec<String> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// First number in a scalar or array payload.
fn first_number(payload: &Value) -> Option<f64> {
    match payload {
        Value::Array(items) => items.first().and_then(Value::as_f64),
        other => other.as_f64(),
    }
}

impl SessionContext {
    /// Name of the opened camera.
    pub fn camera_name(&self) -> &str {
        &self.camera_name
    }

    /// Capabilities reported at connect.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Committed geometry and mode.
    pub fn mode(&self) -> &ModeState {
        &self.mode
    }

    /// Last acknowledged exposure settings.
    pub fn exposure(&self) -> ExposureSettings {
        self.exposure
    }

    /// Generation of the current frame regions.
    pub fn generation(&self) -> u64 {
        self.pool.generation()
    }

    /// Byte capacity of each frame region.
    pub fn buffer_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Whether a reconfiguration or mode switch is awaiting the worker.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn capture_in_progress(&self) -> bool {
        self.capture_in_progress
    }

    fn state_err(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::state(self.mode.streaming_mode, reason)
    }

    fn require(&self, available: bool, feature: &str) -> CaptureResult<()> {
        if available {
            Ok(())
        } else {
            Err(self.state_err(format!("camera has no {feature}")))
        }
    }

    fn ensure_not_pending(&self) -> CaptureResult<()> {
        match &self.pending {
            Some(p) => Err(self.state_err(format!("{} still pending", p.describe()))),
            None => Ok(()),
        }
    }

    fn apply(&mut self, request: ControlRequest, io: &mut Wiring<'_>) -> CaptureResult<()> {
        match request {
            ControlRequest::SelectMode(mode) => self.select_mode(mode, io),
            ControlRequest::ApplyRoi(roi) => self.apply_roi(roi, io),
            ControlRequest::ResetRoi => {
                let full = self.mode.full_roi();
                self.apply_roi(full, io)
            }
            ControlRequest::SetBin(bin) => self.set_bin(bin, io),
            ControlRequest::SetBitDepth(depth) => self.set_bit_depth(depth, io),
            ControlRequest::SetDebayer(enabled) => self.set_debayer(enabled, io),
            ControlRequest::SetExposure(ms) => {
                if !(ms.is_finite() && ms > 0.0) {
                    return Err(CaptureError::InvalidArgument(format!(
                        "exposure must be positive, got {ms} ms"
                    )));
                }
                self.requested_exposure.exposure_ms = ms;
                io.channel.send(Op::SetExposureTime, json!(ms));
                Ok(())
            }
            ControlRequest::SetGain(gain) => {
                self.requested_exposure.gain = gain;
                io.channel.send(Op::SetGain, json!(gain));
                Ok(())
            }
            ControlRequest::SetOffset(offset) => {
                self.requested_exposure.offset = offset;
                io.channel.send(Op::SetOffset, json!(offset));
                Ok(())
            }
            ControlRequest::SetUsbTraffic(value) => {
                io.channel.send(Op::SetUsbTraffic, json!(value));
                Ok(())
            }
            ControlRequest::SetWhiteBalance { red, green, blue } => {
                self.require(self.mode.is_color_sensor, "color sensor")?;
                io.channel.send(Op::SetWhiteBalance, json!([red, green, blue]));
                Ok(())
            }
            ControlRequest::SetTemperature(target) => {
                self.require(self.capabilities.temperature_control, "temperature control")?;
                io.channel.send(Op::SetTemperature, json!(target));
                Ok(())
            }
            ControlRequest::PollTemperature => {
                self.require(self.capabilities.temperature_control, "temperature control")?;
                io.channel.send_command(Command::bare(Op::GetTemperature));
                Ok(())
            }
            ControlRequest::PollHumidity => {
                self.require(self.capabilities.humidity, "humidity sensor")?;
                io.channel.send_command(Command::bare(Op::GetHumidityData));
                Ok(())
            }
            ControlRequest::SetFilterWheel(slot) => {
                self.require(self.capabilities.filter_wheel, "filter wheel")?;
                io.channel.send(Op::SetCfwFilter, Value::String(slot));
                Ok(())
            }
            ControlRequest::SetExternalTrigger {
                interface,
                use_output,
            } => {
                self.require(self.capabilities.external_trigger, "external trigger")?;
                io.channel.send(
                    Op::SetExternalTrigger,
                    json!([interface, use_output, self.mode.frame_shape().to_payload()]),
                );
                Ok(())
            }
            ControlRequest::StopExternalTrigger => {
                self.require(self.capabilities.external_trigger, "external trigger")?;
                io.channel
                    .send_command(Command::bare(Op::StopExternalTrigger));
                Ok(())
            }
            ControlRequest::SetBurstMode { enabled, min, max } => {
                self.require(self.capabilities.burst_mode, "burst mode")?;
                if enabled && min > max {
                    return Err(CaptureError::InvalidArgument(format!(
                        "burst range {min}..{max} is inverted"
                    )));
                }
                if !enabled {
                    self.burst_active = false;
                }
                io.channel.send(Op::SetBurstMode, json!([enabled, min, max]));
                Ok(())
            }
            ControlRequest::StartBurst { min, max } => {
                self.require(self.capabilities.burst_mode, "burst mode")?;
                io.channel.send(Op::StartBurstMode, json!([true, min, max]));
                Ok(())
            }
            ControlRequest::SetGpsControl(on) => {
                self.require(self.capabilities.gps, "GPS")?;
                io.channel.send(Op::SetGpsControl, json!(on));
                Ok(())
            }
            ControlRequest::StartRecording(plan) => {
                if self.recording {
                    return Err(self.state_err("already recording"));
                }
                io.channel.send(Op::StartSaveVideo, plan.to_payload());
                Ok(())
            }
            ControlRequest::StopRecording => {
                if !self.recording {
                    return Err(self.state_err("not recording"));
                }
                io.channel.send_command(Command::bare(Op::StopSaveVideo));
                Ok(())
            }
            ControlRequest::SingleCapture => {
                if self.mode.streaming_mode != StreamingMode::SingleShot {
                    return Err(self.state_err("single capture needs SingleShot mode"));
                }
                self.ensure_not_pending()?;
                if self.capture_in_progress {
                    return Err(self.state_err("capture already in progress"));
                }
                io.channel
                    .send(Op::SingleCapture, self.mode.frame_shape().to_payload());
                self.capture_in_progress = true;
                Ok(())
            }
            ControlRequest::CancelCapture => {
                io.channel.send_command(Command::bare(Op::CancelCapture));
                self.capture_in_progress = false;
                Ok(())
            }
            ControlRequest::RunPlan(plan) => {
                io.channel.send(Op::RunPlan, plan);
                Ok(())
            }
            ControlRequest::Connect { .. } | ControlRequest::Disconnect | ControlRequest::Shutdown => {
                Err(self.state_err("session lifecycle requests are handled by the machine"))
            }
        }
    }

    // ========================================================================
    // Mode switching
    // ========================================================================

    fn select_mode(&mut self, target: StreamingMode, io: &mut Wiring<'_>) -> CaptureResult<()> {
        if target == StreamingMode::Disconnected {
            return Err(CaptureError::InvalidArgument(
                "use disconnect to leave the session".into(),
            ));
        }
        self.ensure_not_pending()?;
        let current = self.mode.streaming_mode;
        if target == current {
            return Ok(());
        }
        if self.capture_in_progress {
            return Err(self.state_err("single capture in progress"));
        }

        let deadline = Instant::now() + io.config.response_timeout();
        if current == StreamingMode::Continuous {
            io.channel.send_command(Command::bare(Op::StopPreview));
            io.mailbox.discard_pending();
            self.pending = Some(Pending::ModeSwitch { target, deadline });
        } else if target == StreamingMode::Continuous {
            io.channel.send(Op::StartPreview, self.start_preview_payload());
            self.pending = Some(Pending::ModeSwitch { target, deadline });
        } else {
            self.mode.streaming_mode = target;
            tracing::info!(mode = %target, "mode changed");
            io.events.push(SessionEvent::ModeChanged(target));
        }
        Ok(())
    }

    fn start_preview_payload(&self) -> Value {
        let shape = self.mode.frame_shape();
        json!([
            shape.width,
            shape.height,
            shape.channels,
            shape.bit_depth,
            self.exposure.exposure_ms,
            self.exposure.gain,
            self.exposure.offset,
            self.mode.debayer_enabled,
        ])
    }

    fn on_mode_ack(&mut self, op: Op, io: &mut Wiring<'_>) {
        let Some(Pending::ModeSwitch { target, .. }) = self.pending else {
            tracing::debug!(%op, "preview ack with no mode switch pending");
            return;
        };
        let expected = if target == StreamingMode::Continuous {
            Op::StartPreview
        } else {
            Op::StopPreview
        };
        if op != expected {
            tracing::warn!(%op, %expected, "unexpected preview ack");
            return;
        }

        self.pending = None;
        if op == Op::StopPreview {
            io.mailbox.discard_pending();
        }
        self.mode.streaming_mode = target;
        tracing::info!(mode = %target, "mode changed");
        io.events.push(SessionEvent::ModeChanged(target));
    }

    // ========================================================================
    // Geometry reconfiguration
    // ========================================================================

    fn apply_roi(&mut self, roi: Roi, io: &mut Wiring<'_>) -> CaptureResult<()> {
        if self.mode.debayer_enabled {
            return Err(self.state_err("ROI is fixed to the full sensor while debayer is on"));
        }
        let normalized = roi.normalize(self.mode.binned_width(), self.mode.binned_height());
        if normalized.is_empty() {
            return Err(CaptureError::InvalidArgument(format!(
                "ROI {roi:?} is empty inside the {}x{} binned sensor",
                self.mode.binned_width(),
                self.mode.binned_height()
            )));
        }
        let mut target = self.mode.clone();
        target.roi = normalized;
        self.begin_reconfiguration(
            ReconfigKind::Roi,
            target,
            vec![Command::set_resolution(normalized)],
            io,
        )
    }

    fn set_bin(&mut self, bin: Bin, io: &mut Wiring<'_>) -> CaptureResult<()> {
        if !self.capabilities.bins.contains(&bin) {
            return Err(CaptureError::InvalidArgument(format!(
                "binning {} not supported",
                bin.label()
            )));
        }
        if self.mode.debayer_enabled && bin != Bin::ONE {
            return Err(self.state_err("binning is unavailable while debayer is on"));
        }
        let mut target = self.mode.clone();
        target.bin = bin;
        target.roi = target.full_roi();
        let steps = vec![
            Command::new(Op::SetCameraPixelBin, Value::String(bin.label())),
            Command::set_resolution(target.roi),
        ];
        self.begin_reconfiguration(ReconfigKind::Bin, target, steps, io)
    }

    fn set_bit_depth(&mut self, depth: BitDepth, io: &mut Wiring<'_>) -> CaptureResult<()> {
        if !self.capabilities.bit_depths.contains(&depth) {
            return Err(CaptureError::InvalidArgument(format!(
                "{}-bit output not supported",
                depth.bits()
            )));
        }
        let mut target = self.mode.clone();
        let mut steps = Vec::with_capacity(2);
        if depth == BitDepth::Sixteen && self.mode.debayer_enabled {
            steps.push(Command::new(Op::UpdateDebayerMode, Value::Bool(false)));
            target.debayer_enabled = false;
        }
        target.bit_depth = depth;
        steps.push(Command::new(Op::SetCameraDepth, json!(depth.bits())));
        self.begin_reconfiguration(ReconfigKind::BitDepth, target, steps, io)
    }

    fn set_debayer(&mut self, enabled: bool, io: &mut Wiring<'_>) -> CaptureResult<()> {
        let mut target = self.mode.clone();
        let mut steps = Vec::with_capacity(2);
        if enabled {
            if !(self.capabilities.debayer && self.mode.debayer_allowed()) {
                return Err(self.state_err(
                    "debayer needs a color sensor at 1x1 binning and 8-bit output",
                ));
            }
            let full = target.full_roi();
            if target.roi != full {
                target.roi = full;
                steps.push(Command::set_resolution(full));
            }
        }
        target.debayer_enabled = enabled;
        steps.push(Command::new(Op::UpdateDebayerMode, Value::Bool(enabled)));
        self.begin_reconfiguration(ReconfigKind::Debayer, target, steps, io)
    }

    fn begin_reconfiguration(
        &mut self,
        kind: ReconfigKind,
        target: ModeState,
        steps: Vec<Command>,
        io: &mut Wiring<'_>,
    ) -> CaptureResult<()> {
        self.ensure_not_pending()?;
        if self.capture_in_progress {
            return Err(self.state_err("single capture in progress"));
        }
        if target == self.mode {
            tracing::debug!(%kind, "geometry unchanged, nothing to do");
            return Ok(());
        }

        let mut steps: VecDeque<Command> = steps.into();
        let paused = self.mode.streaming_mode == StreamingMode::Continuous;
        let now = Instant::now();
        let (stage, deadline) = if paused {
            io.channel.send_command(Command::preview_pause(true));
            (Stage::AwaitingPause, now + io.config.pause_ack_timeout())
        } else {
            let Some(first) = steps.pop_front() else {
                return Ok(());
            };
            let op = first.op;
            io.channel.send_command(first);
            (Stage::AwaitingOp(op), now + io.config.response_timeout())
        };

        tracing::info!(%kind, paused, frame_bytes = target.frame_bytes(), "reconfiguration started");
        self.pending = Some(Pending::Reconfigure(Reconfiguration {
            kind,
            target,
            steps,
            stage,
            paused,
            deadline,
        }));
        Ok(())
    }

    fn on_pause_ack(&mut self, payload: &Value, io: &mut Wiring<'_>) {
        if *payload == Value::Bool(false) {
            tracing::debug!("preview resumed");
            return;
        }
        if self.stale_pause_acks > 0 {
            self.stale_pause_acks -= 1;
            tracing::debug!("late pause ack from an abandoned reconfiguration ignored");
            return;
        }
        let Some(Pending::Reconfigure(rc)) = &mut self.pending else {
            tracing::debug!("pause ack with no reconfiguration pending");
            return;
        };
        if rc.stage != Stage::AwaitingPause {
            tracing::warn!(stage = ?rc.stage, "duplicate pause ack ignored");
            return;
        }

        tracing::debug!(kind = %rc.kind, "preview paused");
        self.send_next_step(io);
    }

    fn on_geometry_ack(&mut self, op: Op, io: &mut Wiring<'_>) {
        let stage = match &self.pending {
            Some(Pending::Reconfigure(rc)) => rc.stage,
            _ => {
                tracing::warn!(%op, "unsolicited geometry ack ignored");
                return;
            }
        };
        match stage {
            Stage::AwaitingPause => {
                self.fail_reconfiguration(
                    format!("{op} acknowledged before the preview pause"),
                    false,
                    io,
                );
            }
            Stage::AwaitingOp(expected) if expected == op => self.send_next_step(io),
            Stage::AwaitingOp(expected) => {
                self.fail_reconfiguration(
                    format!("expected {expected} ack, worker acknowledged {op}"),
                    false,
                    io,
                );
            }
        }
    }

    fn send_next_step(&mut self, io: &mut Wiring<'_>) {
        let Some(Pending::Reconfigure(rc)) = &mut self.pending else {
            return;
        };
        match rc.steps.pop_front() {
            Some(command) => {
                rc.stage = Stage::AwaitingOp(command.op);
                rc.deadline = Instant::now() + io.config.response_timeout();
                io.channel.send_command(command);
            }
            None => self.commit(io),
        }
    }

    fn commit(&mut self, io: &mut Wiring<'_>) {
        let Some(Pending::Reconfigure(rc)) = self.pending.take() else {
            return;
        };
        let proof = if rc.paused {
            Quiesced::pause_acknowledged()
        } else {
            Quiesced::not_streaming()
        };
        let dropped = io.mailbox.discard_pending();

        match self.pool.allocate(rc.target.frame_bytes(), &proof) {
            Ok(announcement) => {
                io.channel.send(Op::SetImageBuffer, announcement.to_payload());
                io.events.push(SessionEvent::BuffersAllocated {
                    generation: announcement.generation,
                    size: announcement.size,
                });
                self.mode = rc.target;
                if rc.paused {
                    io.channel
                        .send_command(Command::update_shared_image(self.mode.frame_shape()));
                    io.channel.send_command(Command::preview_pause(false));
                }
                tracing::info!(
                    kind = %rc.kind,
                    generation = announcement.generation,
                    dropped,
                    "reconfiguration committed"
                );
                io.events.push(SessionEvent::GeometryChanged(self.mode.clone()));
            }
            Err(e) => {
                if rc.paused {
                    io.channel.send_command(Command::preview_pause(false));
                }
                tracing::error!(kind = %rc.kind, error = %e, "frame regions could not be reallocated");
                io.events.push(SessionEvent::ReconfigurationFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Abandon the pending reconfiguration. `pause_answered` is set when the worker already
    /// replied to the pause (with an error), so no late ack for it is expected.
    fn fail_reconfiguration(&mut self, reason: String, pause_answered: bool, io: &mut Wiring<'_>) {
        let Some(Pending::Reconfigure(rc)) = self.pending.take() else {
            return;
        };
        if rc.paused {
            if rc.stage == Stage::AwaitingPause && !pause_answered {
                self.stale_pause_acks += 1;
            }
            io.channel.send_command(Command::preview_pause(false));
        }
        tracing::warn!(kind = %rc.kind, %reason, "reconfiguration abandoned, geometry unchanged");
        io.events.push(SessionEvent::ReconfigurationFailed { reason });
    }

    // ========================================================================
    // Responses, frames, timeouts
    // ========================================================================

    fn on_response(&mut self, response: Response, io: &mut Wiring<'_>) {
        match response.kind {
            ResponseKind::Ack => tracing::trace!(op = ?response.op, "ack"),
            ResponseKind::Tip => {
                let message = response.message();
                tracing::info!(%message, "worker tip");
                io.events.push(SessionEvent::Tip(message));
            }
            ResponseKind::Error => self.on_error(response.op, response.message(), io),
            ResponseKind::Success => match response.op {
                Some(op) => self.on_success(op, &response.payload, io),
                None => tracing::debug!("success without op ignored"),
            },
        }
    }

    fn on_success(&mut self, op: Op, payload: &Value, io: &mut Wiring<'_>) {
        match op {
            Op::SetPreviewPause => self.on_pause_ack(payload, io),
            Op::SetResolution | Op::SetCameraPixelBin | Op::SetCameraDepth | Op::UpdateDebayerMode => {
                self.on_geometry_ack(op, io)
            }
            Op::StartPreview | Op::StopPreview => self.on_mode_ack(op, io),
            Op::SetExposureTime => {
                self.exposure.exposure_ms = self.requested_exposure.exposure_ms;
                io.events.push(SessionEvent::ExposureChanged(self.exposure));
            }
            Op::SetGain => {
                self.exposure.gain = self.requested_exposure.gain;
                io.events.push(SessionEvent::ExposureChanged(self.exposure));
            }
            Op::SetOffset => {
                self.exposure.offset = self.requested_exposure.offset;
                io.events.push(SessionEvent::ExposureChanged(self.exposure));
            }
            Op::GetTemperature => match first_number(payload) {
                Some(t) => io.events.push(SessionEvent::Temperature(t)),
                None => tracing::warn!(%payload, "unreadable temperature"),
            },
            Op::GetHumidityData => match first_number(payload) {
                Some(h) => io.events.push(SessionEvent::Humidity(h)),
                None => tracing::warn!(%payload, "unreadable humidity"),
            },
            Op::StartSaveVideo => {
                self.recording = true;
                tracing::info!("recording started");
                io.events.push(SessionEvent::RecordingStarted);
            }
            Op::StopSaveVideo => {
                self.recording = false;
                tracing::info!("recording stopped");
                io.events.push(SessionEvent::RecordingStopped);
            }
            Op::CancelCapture => {
                self.capture_in_progress = false;
                io.events.push(SessionEvent::CaptureCancelled);
            }
            Op::SingleCapture => {
                // frame-less success: the worker finished without publishing
                self.capture_in_progress = false;
                io.events.push(SessionEvent::OperationSucceeded {
                    op,
                    payload: payload.clone(),
                });
            }
            Op::StartBurstMode => {
                self.burst_active = true;
                io.events.push(SessionEvent::OperationSucceeded {
                    op,
                    payload: payload.clone(),
                });
            }
            Op::SetExternalTrigger | Op::StopExternalTrigger => {
                self.trigger_active = op == Op::SetExternalTrigger;
                io.events.push(SessionEvent::OperationSucceeded {
                    op,
                    payload: payload.clone(),
                });
            }
            Op::SetBurstMode
            | Op::SetUsbTraffic
            | Op::SetWhiteBalance
            | Op::SetTemperature
            | Op::SetCfwFilter
            | Op::SetGpsControl
            | Op::RunPlan => io.events.push(SessionEvent::OperationSucceeded {
                op,
                payload: payload.clone(),
            }),
            Op::InitResource
            | Op::ReadCameraName
            | Op::OpenCamera
            | Op::InitCamera
            | Op::CloseCamera
            | Op::GetImageBufferSize
            | Op::SetImageBuffer
            | Op::UpdateSharedImageData
            | Op::Stop => tracing::debug!(%op, "acknowledged"),
        }
    }

    fn on_error(&mut self, op: Option<Op>, message: String, io: &mut Wiring<'_>) {
        tracing::warn!(op = ?op, %message, "worker error");
        match (op, &self.pending) {
            (
                Some(
                    failed @ (Op::SetPreviewPause
                    | Op::SetResolution
                    | Op::SetCameraPixelBin
                    | Op::SetCameraDepth
                    | Op::UpdateDebayerMode),
                ),
                Some(Pending::Reconfigure(_)),
            ) => self.fail_reconfiguration(
                format!("{failed} failed: {message}"),
                failed == Op::SetPreviewPause,
                io,
            ),
            (Some(failed @ (Op::StartPreview | Op::StopPreview)), Some(Pending::ModeSwitch { .. })) => {
                self.pending = None;
                io.events.push(SessionEvent::ModeChangeFailed {
                    reason: format!("{failed} failed: {message}"),
                });
            }
            (Some(Op::SingleCapture), _) => self.capture_in_progress = false,
            (Some(Op::StartSaveVideo), _) => self.recording = false,
            (Some(Op::StartBurstMode), _) => self.burst_active = false,
            _ => {}
        }
        io.events.push(SessionEvent::DeviceError { op, message });
    }

    fn on_frame(
        &mut self,
        origin: FrameOrigin,
        frame: FrameMessage,
        io: &mut Wiring<'_>,
    ) -> Option<FrameMessage> {
        match origin {
            FrameOrigin::SingleCapture => {
                self.capture_in_progress = false;
                Some(frame)
            }
            FrameOrigin::Live => {
                let stopping = matches!(
                    self.pending,
                    Some(Pending::ModeSwitch { target, .. }) if target != StreamingMode::Continuous
                );
                let streaming = self.mode.streaming_mode == StreamingMode::Continuous
                    || self.burst_active
                    || self.trigger_active;
                if streaming && !stopping {
                    io.mailbox.publish(frame);
                } else {
                    tracing::trace!(generation = frame.generation, "live frame outside streaming dropped");
                }
                None
            }
        }
    }

    fn tick(&mut self, now: Instant, io: &mut Wiring<'_>) {
        let expired = match &self.pending {
            Some(Pending::Reconfigure(rc)) if now >= rc.deadline => Some(match rc.stage {
                Stage::AwaitingPause => CaptureError::Timeout("the preview pause acknowledgment".into()),
                Stage::AwaitingOp(op) => CaptureError::Timeout(op.to_string()),
            }
            .to_string()),
            Some(Pending::ModeSwitch { target, deadline }) if now >= *deadline => {
                Some(CaptureError::Timeout(format!("the switch to {target}")).to_string())
            }
            _ => None,
        };
        let Some(reason) = expired else {
            return;
        };
        if matches!(self.pending, Some(Pending::ModeSwitch { .. })) {
            tracing::warn!(%reason, "mode switch abandoned");
            self.pending = None;
            io.events.push(SessionEvent::ModeChangeFailed { reason });
        } else {
            self.fail_reconfiguration(reason, false, io);
        }
    }
}
