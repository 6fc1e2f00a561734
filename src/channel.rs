//! Ordered, non-blocking command link between the controller and the camera worker.
//!
//! [`command_channel`] returns three ends:
//!
//! - [`CommandChannel`]: owned by the session state machine; `send` never blocks and never fails
//!   from the caller's point of view.
//! - [`ResponseStream`]: owned by the controller loop; yields decoded [`WorkerMessage`]s.
//! - [`WorkerEndpoint`]: handed to whatever executes commands against the device.
//!
//! Both directions are FIFO unbounded tokio mpsc queues. When the worker side goes away the
//! channel flips to unavailable and later sends are dropped with a warning; callers that need a
//! response check [`CommandChannel::is_available`] first.

use crate::error::CaptureError;
use crate::messages::{Command, Envelope, FrameMessage, Op, WorkerMessage, PREVIEW_FRAME};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Number of recently sent ops kept for diagnostics.
const COMMAND_LOG_LEN: usize = 256;

/// Create a connected controller/worker channel.
pub fn command_channel() -> (CommandChannel, ResponseStream, WorkerEndpoint) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    let available = Arc::new(AtomicBool::new(true));

    (
        CommandChannel {
            tx: cmd_tx,
            available: available.clone(),
            log: VecDeque::with_capacity(COMMAND_LOG_LEN),
        },
        ResponseStream {
            rx: resp_rx,
            available,
        },
        WorkerEndpoint {
            rx: cmd_rx,
            tx: resp_tx,
        },
    )
}

/// Sending half used by the controller.
#[derive(Debug)]
pub struct CommandChannel {
    tx: mpsc::UnboundedSender<Command>,
    available: Arc<AtomicBool>,
    log: VecDeque<Op>,
}

impl CommandChannel {
    /// Queue a command. Dropped, with a warning, when the channel is unavailable.
    pub fn send(&mut self, op: Op, payload: Value) {
        self.send_command(Command::new(op, payload));
    }

    /// Queue a prepared command.
    pub fn send_command(&mut self, command: Command) {
        let op = command.op;
        if !self.is_available() {
            let err = CaptureError::ChannelUnavailable {
                op: op.to_string(),
            };
            tracing::warn!(error = %err, "command dropped");
            return;
        }

        if self.tx.send(command).is_err() {
            self.available.store(false, Ordering::Release);
            tracing::warn!(%op, "worker gone, command dropped");
            return;
        }

        tracing::debug!(%op, "command queued");
        if self.log.len() == COMMAND_LOG_LEN {
            self.log.pop_front();
        }
        self.log.push_back(op);
    }

    /// Whether sends currently reach the worker.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Mark the channel unavailable; subsequent sends are dropped.
    pub fn close(&self) {
        self.available.store(false, Ordering::Release);
    }

    /// Ops queued so far, oldest first (bounded).
    pub fn sent_ops(&self) -> impl Iterator<Item = Op> + '_ {
        self.log.iter().copied()
    }

    /// Forget the command log.
    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

/// Receiving half used by the controller loop.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<Envelope>,
    available: Arc<AtomicBool>,
}

impl ResponseStream {
    /// Next message from the worker; `None` once the worker has hung up.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        match self.rx.recv().await {
            Some(envelope) => Some(WorkerMessage::from_envelope(envelope)),
            None => {
                self.available.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(WorkerMessage::from_envelope(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.available.store(false, Ordering::Release);
                None
            }
        }
    }
}

/// Worker side of the channel.
#[derive(Debug)]
pub struct WorkerEndpoint {
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerEndpoint {
    /// Next command; `None` when the controller has dropped its end.
    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    /// Send a raw envelope; returns `false` if the controller is gone.
    pub fn reply(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    /// `<op>_success`.
    pub fn success(&self, op: Op, data: Value) -> bool {
        self.reply(Envelope::success(op, data))
    }

    /// `error`, attributed to `op`.
    pub fn error(&self, op: Op, message: impl Into<String>) -> bool {
        self.reply(Envelope::new(
            "error",
            json!({ "order": op.as_str(), "message": message.into() }),
        ))
    }

    /// `tip`.
    pub fn tip(&self, message: impl Into<String>) -> bool {
        self.reply(Envelope::new("tip", Value::String(message.into())))
    }

    /// `preview_frame`.
    pub fn frame(&self, frame: &FrameMessage) -> bool {
        match serde_json::to_value(frame) {
            Ok(data) => self.reply(Envelope::new(PREVIEW_FRAME, data)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode frame message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BufferSelector, FrameShape, ResponseKind};

    #[tokio::test]
    async fn commands_arrive_in_order() {
        let (mut channel, _responses, mut worker) = command_channel();
        channel.send(Op::SetPreviewPause, json!(true));
        channel.send(Op::SetResolution, json!([0, 0, 10, 10]));
        channel.send(Op::SetPreviewPause, json!(false));

        assert_eq!(worker.recv().await.unwrap().payload, json!(true));
        assert_eq!(worker.recv().await.unwrap().op, Op::SetResolution);
        assert_eq!(worker.recv().await.unwrap().payload, json!(false));
        assert_eq!(
            channel.sent_ops().collect::<Vec<_>>(),
            vec![Op::SetPreviewPause, Op::SetResolution, Op::SetPreviewPause]
        );
    }

    #[tokio::test]
    async fn send_after_worker_drop_is_silently_discarded() {
        let (mut channel, _responses, worker) = command_channel();
        drop(worker);
        assert!(!channel.is_available());
        channel.send(Op::GetTemperature, Value::Null);
        assert_eq!(channel.sent_ops().count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_drops_sends() {
        let (mut channel, _responses, mut worker) = command_channel();
        channel.close();
        channel.send(Op::StartPreview, Value::Null);
        assert!(worker.try_recv().is_none());
    }

    #[tokio::test]
    async fn responses_are_decoded() {
        let (_channel, mut responses, worker) = command_channel();
        worker.success(Op::SetCameraDepth, json!(16));
        worker.error(Op::SetGain, "gain out of range");
        worker.frame(&FrameMessage {
            fps: 30.0,
            byte_size: 4,
            shape: FrameShape::new(2, 2, 1, 8),
            buffer_selector: BufferSelector::Primary,
            generation: 1,
            telemetry: None,
        });

        match responses.recv().await.unwrap() {
            WorkerMessage::Response(r) => {
                assert_eq!(r.op, Some(Op::SetCameraDepth));
                assert_eq!(r.kind, ResponseKind::Success);
            }
            other => panic!("unexpected {other:?}"),
        }
        match responses.recv().await.unwrap() {
            WorkerMessage::Response(r) => {
                assert_eq!(r.op, Some(Op::SetGain));
                assert_eq!(r.kind, ResponseKind::Error);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            responses.recv().await.unwrap(),
            WorkerMessage::Frame { .. }
        ));
    }

    #[tokio::test]
    async fn stream_end_marks_channel_unavailable() {
        let (channel, mut responses, worker) = command_channel();
        drop(worker);
        assert!(responses.recv().await.is_none());
        assert!(!channel.is_available());
    }
}
