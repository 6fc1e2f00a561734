//! Controller loop: worker messages in, decoded frames and session events out.
//!
//! The controller owns the [`ModeStateMachine`] and a [`FramePipeline`]. A single task
//! multiplexes three sources with `tokio::select!`:
//!
//! - worker messages from the [`ResponseStream`] (responses update the session, frames are
//!   routed to the drop-oldest mailbox),
//! - control requests from the UI,
//! - a display ticker that drains the mailbox and decodes only the newest frame.
//!
//! Frame errors never stop the loop; they are logged and the frame is skipped.

use crate::channel::{command_channel, ResponseStream, WorkerEndpoint};
use crate::color::{debayer, BayerPattern, GainLutCache, WhiteBalanceGains};
use crate::color::white_balance::apply_to_frame;
use crate::config::AppConfig;
use crate::data::decoder::{decode, DecodedFrame};
use crate::data::telemetry::{self, LocalZone, TelemetryRecord};
use crate::error::{CaptureError, CaptureResult};
use crate::messages::{FrameMessage, FrameOrigin};
use crate::session::{ControlRequest, ModeStateMachine, SessionEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Poll period when no display rate limit is configured.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// A frame ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredFrame {
    /// Live stream or single capture
    pub origin: FrameOrigin,
    /// Region generation the bytes were read from
    pub generation: u64,
    /// Worker-reported frame rate
    pub fps: f64,
    /// Pixels
    pub image: DecodedFrame,
    /// GPS telemetry, when present and readable
    pub telemetry: Option<TelemetryRecord>,
}

/// Counters kept by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames decoded and delivered
    pub delivered: u64,
    /// Ticks skipped by the display rate limit
    pub throttled: u64,
    /// Frames dropped because the bytes did not match the announcement
    pub buffer_errors: u64,
    /// Frames delivered without their unreadable telemetry
    pub telemetry_errors: u64,
}

/// Decode stage between the mailbox and the display.
pub struct FramePipeline {
    bayer_pattern: BayerPattern,
    zone: LocalZone,
    min_interval: Option<Duration>,
    last_delivery: Option<Instant>,
    white_balance: Option<WhiteBalanceGains>,
    luts: Arc<GainLutCache>,
    stats: PipelineStats,
}

impl FramePipeline {
    /// Pipeline using the color and telemetry sections of `config`.
    pub fn new(config: &AppConfig, luts: Arc<GainLutCache>) -> CaptureResult<Self> {
        let zone = config
            .telemetry
            .zone()
            .map_err(CaptureError::Configuration)?;
        let fps = config.application.max_display_fps;
        let min_interval = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));

        Ok(Self {
            bayer_pattern: config.color.bayer_pattern,
            zone,
            min_interval,
            last_delivery: None,
            white_balance: None,
            luts,
            stats: PipelineStats::default(),
        })
    }

    /// Software white balance for 3-channel frames; `None` turns it off.
    pub fn set_white_balance(&mut self, gains: Option<WhiteBalanceGains>) {
        self.white_balance = gains;
    }

    /// Software debayer pattern for mono frames from a color sensor.
    pub fn set_bayer_pattern(&mut self, pattern: BayerPattern) {
        self.bayer_pattern = pattern;
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Minimum spacing between delivered live frames.
    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Decode the newest live frame, discarding everything older.
    ///
    /// Returns `None` when the mailbox is empty, when the display rate limit has not elapsed
    /// (the mailbox is left alone so the next tick still sees the newest frame), or when the
    /// frame had to be dropped.
    pub fn consume_latest(&mut self, machine: &ModeStateMachine, now: Instant) -> Option<DeliveredFrame> {
        if let (Some(last), Some(interval)) = (self.last_delivery, self.min_interval) {
            if now.saturating_duration_since(last) < interval {
                if machine.mailbox().pending() > 0 {
                    self.stats.throttled += 1;
                }
                return None;
            }
        }

        let frame = machine.mailbox().take_latest()?;
        let delivered = self.process(machine, FrameOrigin::Live, &frame)?;
        self.last_delivery = Some(now);
        Some(delivered)
    }

    /// Read, decode and post-process one announced frame.
    pub fn process(
        &mut self,
        machine: &ModeStateMachine,
        origin: FrameOrigin,
        frame: &FrameMessage,
    ) -> Option<DeliveredFrame> {
        let image = match machine
            .consume(frame)
            .and_then(|raw| decode(raw, &frame.shape))
        {
            Ok(image) => image,
            Err(e) => {
                if e.is_buffer_error() {
                    self.stats.buffer_errors += 1;
                }
                tracing::warn!(generation = frame.generation, error = %e, "frame dropped");
                return None;
            }
        };

        let image = self.colorize(machine, image);

        // an empty block means the camera has no GPS fix to report
        let telemetry = frame
            .telemetry
            .as_deref()
            .filter(|block| !block.is_empty())
            .and_then(|block| match telemetry::decode(block, self.zone) {
                Ok(record) => Some(record),
                Err(e) => {
                    self.stats.telemetry_errors += 1;
                    tracing::warn!(error = %e, "telemetry unreadable, frame delivered without it");
                    None
                }
            });

        self.stats.delivered += 1;
        Some(DeliveredFrame {
            origin,
            generation: frame.generation,
            fps: frame.fps,
            image,
            telemetry,
        })
    }

    fn colorize(&self, machine: &ModeStateMachine, image: DecodedFrame) -> DecodedFrame {
        let color_sensor = machine
            .session()
            .is_some_and(|s| s.mode().is_color_sensor);

        let mut image = if image.channels() == 1
            && color_sensor
            && self.bayer_pattern != BayerPattern::None
        {
            match debayer(&image, self.bayer_pattern) {
                Ok(rgb) => rgb,
                Err(e) => {
                    tracing::warn!(error = %e, pattern = %self.bayer_pattern, "debayer skipped");
                    image
                }
            }
        } else {
            image
        };

        if let Some(gains) = self.white_balance {
            if image.channels() == 3 {
                if let Err(e) = apply_to_frame(&mut image, gains, &self.luts) {
                    tracing::warn!(error = %e, "white balance skipped");
                }
            }
        }
        image
    }
}

/// The controller: session state machine, response stream and frame pipeline.
pub struct CaptureController {
    machine: ModeStateMachine,
    responses: ResponseStream,
    pipeline: FramePipeline,
}

impl CaptureController {
    /// Controller plus the worker end of a fresh channel.
    pub fn new(config: &AppConfig, luts: Arc<GainLutCache>) -> CaptureResult<(Self, WorkerEndpoint)> {
        let (channel, responses, worker) = command_channel();
        let controller = Self {
            machine: ModeStateMachine::new(config, channel),
            responses,
            pipeline: FramePipeline::new(config, luts)?,
        };
        Ok((controller, worker))
    }

    /// Session events from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.machine.subscribe()
    }

    pub fn machine(&self) -> &ModeStateMachine {
        &self.machine
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut FramePipeline {
        &mut self.pipeline
    }

    /// Apply a control request immediately.
    pub fn request(&mut self, request: ControlRequest) -> CaptureResult<()> {
        self.machine.handle_request(request)
    }

    /// Process every worker message already queued, expire timeouts, then run one
    /// consumption tick. Single captures are decoded right away and come first.
    pub fn step(&mut self, now: Instant) -> Vec<DeliveredFrame> {
        let mut delivered = Vec::new();
        while let Some(message) = self.responses.try_recv() {
            if let Some(frame) = self.machine.handle_message(message) {
                delivered.extend(
                    self.pipeline
                        .process(&self.machine, FrameOrigin::SingleCapture, &frame),
                );
            }
        }
        self.machine.tick(now);
        delivered.extend(self.pipeline.consume_latest(&self.machine, now));
        delivered
    }

    /// Run until a `Shutdown` request, the request sender is dropped, or the worker hangs up.
    ///
    /// Decoded frames go to `frames`; when the display is behind, frames are dropped rather
    /// than queued.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
        frames: mpsc::Sender<DeliveredFrame>,
    ) -> CaptureResult<()> {
        let mut ticker = tokio::time::interval(self.pipeline.min_interval().unwrap_or(IDLE_POLL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("controller loop started");

        loop {
            tokio::select! {
                message = self.responses.recv() => {
                    let Some(message) = message else {
                        tracing::warn!("worker hung up, controller stopping");
                        break;
                    };
                    if let Some(frame) = self.machine.handle_message(message) {
                        if let Some(out) = self.pipeline.process(&self.machine, FrameOrigin::SingleCapture, &frame) {
                            deliver(&frames, out);
                        }
                    }
                }
                request = requests.recv() => {
                    let request = request.unwrap_or(ControlRequest::Shutdown);
                    let shutdown = request == ControlRequest::Shutdown;
                    if let Err(e) = self.machine.handle_request(request) {
                        tracing::warn!(error = %e, "control request refused");
                    }
                    if shutdown {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.machine.tick(now);
                    if let Some(out) = self.pipeline.consume_latest(&self.machine, now) {
                        deliver(&frames, out);
                    }
                }
            }
        }

        let stats = self.pipeline.stats();
        let mailbox = self.machine.mailbox().stats();
        tracing::info!(
            delivered = stats.delivered,
            throttled = stats.throttled,
            buffer_errors = stats.buffer_errors,
            mailbox_dropped = mailbox.dropped,
            "controller loop stopped"
        );
        Ok(())
    }
}

fn deliver(frames: &mpsc::Sender<DeliveredFrame>, frame: DeliveredFrame) {
    if let Err(mpsc::error::TrySendError::Full(frame)) = frames.try_send(frame) {
        tracing::debug!(generation = frame.generation, "display busy, frame dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::GainGrid;
    use crate::data::frame_buffer::{RegionAnnouncement, RegionWriter};
    use crate::messages::{BufferSelector, Command, FrameShape, Op};
    use crate::session::StreamingMode;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn small_grid() -> GainGrid {
        GainGrid {
            start: 1.0,
            end: 2.0,
            step: 0.5,
        }
    }

    struct Rig {
        controller: CaptureController,
        worker: WorkerEndpoint,
        writer: Option<RegionWriter>,
        _dir: TempDir,
    }

    impl Rig {
        fn new(max_display_fps: f64) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.buffers.shm_dir = dir.path().to_path_buf();
            config.application.max_display_fps = max_display_fps;
            let luts = Arc::new(GainLutCache::build(small_grid()));
            let (controller, worker) = CaptureController::new(&config, luts).unwrap();
            Self {
                controller,
                worker,
                writer: None,
                _dir: dir,
            }
        }

        /// Answer queued commands the way a mono 64x48 camera would.
        fn serve(&mut self) {
            while let Some(Command { op, payload }) = self.worker.try_recv() {
                let reply = match op {
                    Op::ReadCameraName => json!(["sim"]),
                    Op::GetImageBufferSize => json!(64 * 48),
                    Op::InitCamera => json!({
                        "readout_w": 64, "readout_h": 48, "is_color": false,
                        "pixel_bin": {"1*1": [1, 1]}, "depth": {"8bit": 8, "16bit": 16}
                    }),
                    Op::SetImageBuffer => {
                        let announcement = RegionAnnouncement::from_payload(&payload).unwrap();
                        self.writer = Some(RegionWriter::open(&announcement).unwrap());
                        Value::Null
                    }
                    _ => payload,
                };
                self.worker.success(op, reply);
            }
        }

        fn connect_and_stream(&mut self) {
            self.controller
                .request(ControlRequest::Connect { camera: None })
                .unwrap();
            for _ in 0..6 {
                self.serve();
                self.controller.step(Instant::now());
            }
            assert_eq!(self.controller.machine().streaming_mode(), StreamingMode::Idle);
            self.controller
                .request(ControlRequest::SelectMode(StreamingMode::Continuous))
                .unwrap();
            self.serve();
            self.controller.step(Instant::now());
            assert_eq!(
                self.controller.machine().streaming_mode(),
                StreamingMode::Continuous
            );
        }

        fn publish(&mut self, selector: BufferSelector, fill: u8, telemetry: Option<Vec<u8>>) {
            let writer = self.writer.as_mut().unwrap();
            writer.write(selector, &vec![fill; 64 * 48]).unwrap();
            let frame = FrameMessage {
                fps: 20.0,
                byte_size: 64 * 48,
                shape: FrameShape::new(64, 48, 1, 8),
                buffer_selector: selector,
                generation: writer.generation(),
                telemetry,
            };
            self.worker.frame(&frame);
        }
    }

    #[test]
    fn only_the_newest_frame_is_decoded() {
        let mut rig = Rig::new(0.0);
        rig.connect_and_stream();

        rig.publish(BufferSelector::Primary, 1, None);
        rig.publish(BufferSelector::Secondary, 2, None);
        rig.publish(BufferSelector::Primary, 3, None);
        let delivered = rig.controller.step(Instant::now());

        assert_eq!(delivered.len(), 1);
        let DecodedFrame::Mono8(pixels) = &delivered[0].image else {
            panic!("expected Mono8");
        };
        assert!(pixels.iter().all(|v| *v == 3));
        assert_eq!(rig.controller.pipeline().stats().delivered, 1);
        assert_eq!(rig.controller.machine().mailbox().stats().dropped, 2);
    }

    #[test]
    fn display_rate_limit_skips_ticks() {
        let mut rig = Rig::new(10.0);
        rig.connect_and_stream();
        let start = Instant::now();

        rig.publish(BufferSelector::Primary, 1, None);
        assert_eq!(rig.controller.step(start).len(), 1);

        rig.publish(BufferSelector::Secondary, 2, None);
        assert!(rig.controller.step(start + Duration::from_millis(20)).is_empty());
        assert_eq!(rig.controller.pipeline().stats().throttled, 1);

        let later = rig.controller.step(start + Duration::from_millis(120));
        assert_eq!(later.len(), 1);
    }

    #[test]
    #[tracing_test::traced_test]
    fn short_telemetry_still_delivers_the_frame() {
        let mut rig = Rig::new(0.0);
        rig.connect_and_stream();
        rig.publish(BufferSelector::Primary, 9, Some(vec![0u8; 10]));

        let delivered = rig.controller.step(Instant::now());
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].telemetry.is_none());
        assert_eq!(rig.controller.pipeline().stats().telemetry_errors, 1);
        assert!(logs_contain("telemetry unreadable"));
    }

    #[test]
    fn empty_telemetry_block_is_not_an_error() {
        let mut rig = Rig::new(0.0);
        rig.connect_and_stream();
        rig.publish(BufferSelector::Primary, 4, Some(Vec::new()));

        let delivered = rig.controller.step(Instant::now());
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].telemetry.is_none());
        assert_eq!(rig.controller.pipeline().stats().telemetry_errors, 0);
    }

    #[test]
    fn stale_generation_is_dropped() {
        let mut rig = Rig::new(0.0);
        rig.connect_and_stream();
        let writer = rig.writer.as_mut().unwrap();
        writer.write(BufferSelector::Primary, &[5; 64 * 48]).unwrap();
        rig.worker.frame(&FrameMessage {
            fps: 20.0,
            byte_size: 64 * 48,
            shape: FrameShape::new(64, 48, 1, 8),
            buffer_selector: BufferSelector::Primary,
            generation: 99,
            telemetry: None,
        });

        assert!(rig.controller.step(Instant::now()).is_empty());
        assert_eq!(rig.controller.pipeline().stats().buffer_errors, 1);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let rig = Rig::new(30.0);
        let (req_tx, req_rx) = mpsc::channel(4);
        let (frame_tx, _frame_rx) = mpsc::channel(4);
        let handle = tokio::spawn(rig.controller.run(req_rx, frame_tx));
        req_tx.send(ControlRequest::Shutdown).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        tokio_test::assert_ok!(result);
    }
}
