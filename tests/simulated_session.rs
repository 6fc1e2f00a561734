//! End-to-end sessions against the simulated camera worker.
//!
//! These run the real async controller loop and the simulated worker on the tokio runtime,
//! with shared regions placed in a temporary directory.

use ccd_capture::color::{GainGrid, GainLutCache};
use ccd_capture::config::AppConfig;
use ccd_capture::controller::{CaptureController, DeliveredFrame};
use ccd_capture::hardware::{SimulatedCamera, SimulatedWorker};
use ccd_capture::messages::FrameOrigin;
use ccd_capture::session::{ControlRequest, Roi, SessionEvent, StreamingMode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Session {
    requests: mpsc::Sender<ControlRequest>,
    frames: mpsc::Receiver<DeliveredFrame>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    controller: JoinHandle<ccd_capture::CaptureResult<()>>,
    stop_worker: oneshot::Sender<()>,
    worker: JoinHandle<anyhow::Result<u64>>,
    _dir: TempDir,
}

impl Session {
    fn start(camera: SimulatedCamera) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.buffers.shm_dir = dir.path().to_path_buf();
        config.application.max_display_fps = 200.0;
        config.session.pause_ack_timeout_ms = 2000;

        let luts = Arc::new(GainLutCache::build(GainGrid {
            start: 1.0,
            end: 2.0,
            step: 0.5,
        }));
        let (mut controller, endpoint) = CaptureController::new(&config, luts).unwrap();
        let events = controller.subscribe();
        let (stop_worker, worker) = SimulatedWorker::new(endpoint, camera).spawn();

        let (requests, request_rx) = mpsc::channel(16);
        let (frame_tx, frames) = mpsc::channel(64);
        let controller = tokio::spawn(controller.run(request_rx, frame_tx));

        Self {
            requests,
            frames,
            events,
            controller,
            stop_worker,
            worker,
            _dir: dir,
        }
    }

    async fn send(&self, request: ControlRequest) {
        self.requests.send(request).await.unwrap();
    }

    async fn wait_event(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    async fn wait_frame(&mut self, pred: impl Fn(&DeliveredFrame) -> bool) -> DeliveredFrame {
        timeout(WAIT, async {
            loop {
                let frame = self.frames.recv().await.expect("frame stream closed");
                if pred(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    async fn connect(&mut self) -> SessionEvent {
        self.send(ControlRequest::Connect { camera: None }).await;
        self.wait_event(|e| matches!(e, SessionEvent::Connected { .. }))
            .await
    }

    async fn stream(&mut self) {
        self.send(ControlRequest::SelectMode(StreamingMode::Continuous))
            .await;
        self.wait_event(|e| matches!(e, SessionEvent::ModeChanged(StreamingMode::Continuous)))
            .await;
    }

    /// Shut down and return the number of frames the worker published.
    async fn finish(self) -> u64 {
        self.send(ControlRequest::Shutdown).await;
        timeout(WAIT, self.controller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let _ = self.stop_worker.send(());
        timeout(WAIT, self.worker).await.unwrap().unwrap().unwrap()
    }
}

fn fast_camera(width: u32, height: u32) -> SimulatedCamera {
    SimulatedCamera::new(width, height).with_frame_interval(Duration::from_millis(5))
}

#[tokio::test]
async fn connect_reports_sensor_capabilities() {
    let mut session = Session::start(fast_camera(320, 240));

    let SessionEvent::Connected {
        camera,
        capabilities,
        mode,
    } = session.connect().await
    else {
        unreachable!()
    };
    assert_eq!(camera, "SIM-CCD-0001");
    assert_eq!(capabilities.sensor_width, 320);
    assert!(!capabilities.is_color);
    assert_eq!(mode.roi, Roi::full(320, 240));

    assert!(session.finish().await == 0);
}

#[tokio::test]
async fn live_frames_reach_the_display() {
    let mut session = Session::start(fast_camera(320, 240));
    session.connect().await;
    session.stream().await;

    let frame = session.wait_frame(|_| true).await;
    assert_eq!(frame.origin, FrameOrigin::Live);
    assert_eq!((frame.image.width(), frame.image.height()), (320, 240));
    assert_eq!(frame.image.channels(), 1);
    assert!(frame.telemetry.is_none());

    assert!(session.finish().await > 0);
}

#[tokio::test]
async fn roi_change_while_streaming_switches_geometry_and_generation() {
    let mut session = Session::start(fast_camera(320, 240));
    session.connect().await;
    session.stream().await;
    let before = session.wait_frame(|_| true).await;

    session
        .send(ControlRequest::ApplyRoi(Roi::new(10, 20, 160, 120)))
        .await;
    let SessionEvent::GeometryChanged(mode) = session
        .wait_event(|e| matches!(e, SessionEvent::GeometryChanged(m) if m.roi.width == 160))
        .await
    else {
        unreachable!()
    };
    assert_eq!(mode.roi, Roi::new(10, 20, 160, 120));

    let after = session.wait_frame(|f| f.image.width() == 160).await;
    assert_eq!(after.image.height(), 120);
    assert!(after.generation > before.generation);

    session.finish().await;
}

#[tokio::test]
async fn gps_camera_attaches_telemetry() {
    let mut session = Session::start(fast_camera(128, 96).with_gps());
    session.connect().await;
    session.stream().await;

    let frame = session.wait_frame(|f| f.telemetry.is_some()).await;
    let record = frame.telemetry.unwrap();
    assert_eq!((record.width, record.height), (128, 96));
    assert_eq!(record.status_flag, 3);
    assert_eq!(record.exposure_micros, 40_000);

    session.finish().await;
}

#[tokio::test]
async fn single_capture_is_delivered_once() {
    let mut session = Session::start(fast_camera(64, 48));
    session.connect().await;
    session
        .send(ControlRequest::SelectMode(StreamingMode::SingleShot))
        .await;
    session
        .wait_event(|e| matches!(e, SessionEvent::ModeChanged(StreamingMode::SingleShot)))
        .await;

    session.send(ControlRequest::SingleCapture).await;
    let frame = session
        .wait_frame(|f| f.origin == FrameOrigin::SingleCapture)
        .await;
    assert_eq!((frame.image.width(), frame.image.height()), (64, 48));

    session.finish().await;
}

#[tokio::test]
async fn color_sensor_can_enable_hardware_debayer() {
    let mut session = Session::start(fast_camera(128, 96).color());
    session.connect().await;
    session.stream().await;

    session.send(ControlRequest::SetDebayer(true)).await;
    session
        .wait_event(|e| matches!(e, SessionEvent::GeometryChanged(m) if m.debayer_enabled))
        .await;

    let frame = session.wait_frame(|f| f.image.channels() == 3).await;
    assert_eq!((frame.image.width(), frame.image.height()), (128, 96));

    session.finish().await;
}
