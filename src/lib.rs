//! # CCD Capture Core Library
//!
//! This crate is the control-side core of a capture application for scientific CCD/CMOS
//! cameras. The camera SDK runs in a separate worker that talks to the controller through
//! JSON command/response envelopes and publishes pixels into two shared-memory regions.
//! The library owns everything on the controller side of that boundary, so the binary
//! (`main.rs`), the tests and any future frontend share the same session logic.
//!
//! ## Crate Structure
//!
//! - **`messages`**: The command vocabulary (`Op`), the `{order, data}` envelope and the
//!   interpretation of worker replies and frame notifications.
//! - **`channel`**: The in-process command channel between controller and worker.
//! - **`session`**: Streaming modes, geometry types and the `ModeStateMachine` that drives
//!   connect handshakes, mode switches and pause/reconfigure/resume sequences.
//! - **`data`**: Shared frame regions (`memmap2`), the drop-oldest frame mailbox, pixel
//!   decoding into `ndarray` arrays and the GPS telemetry block decoder.
//! - **`color`**: Gain lookup tables, software white balance and Bayer demosaicing.
//! - **`controller`**: The frame pipeline and the async `CaptureController` loop that ties
//!   the pieces together.
//! - **`hardware`**: A simulated camera worker for running without a device.
//! - **`config`**: Layered configuration (defaults, TOML file, `CCD_CAPTURE_*` environment).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The `CaptureError` enum used across the crate.

pub mod channel;
pub mod color;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod session;

pub use channel::{command_channel, CommandChannel, ResponseStream, WorkerEndpoint};
pub use config::AppConfig;
pub use controller::{CaptureController, DeliveredFrame, FramePipeline};
pub use error::{CaptureError, CaptureResult};
pub use messages::{Command, Envelope, FrameMessage, FrameShape, Op, WorkerMessage};
pub use session::{ControlRequest, ModeStateMachine, SessionEvent, StreamingMode};
