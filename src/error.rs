//! Custom error types for the capture controller.
//!
//! `CaptureError` is the single error type returned by the library. It is built with
//! `thiserror` and groups failures into the categories the controller reacts to:
//!
//! - **Channel**: the command channel to the camera worker is gone. Sends are dropped and
//!   callers poll [`crate::channel::CommandChannel::is_available`].
//! - **Protocol**: the worker sent something the controller cannot interpret. These are turned
//!   into a generic `error` response and never abort the session.
//! - **Buffer / FrameSize**: a frame descriptor disagrees with the bytes available in the
//!   shared region. The frame is dropped and the stream continues.
//! - **UnsupportedFormat**: a bit depth, channel count or array rank the pipeline does not handle.
//! - **State**: an operation that is not valid in the current session state. The request is
//!   ignored, never queued.
//! - **TelemetryParse**: the GPS block attached to a frame is too short. The image is still
//!   delivered.
//! - **Lut**: the gain lookup-table cache on disk is missing or unreadable; the caller rebuilds.
//! - **Config / Configuration / Io**: startup failures.
//!
//! Nothing in the core terminates the process; [`CaptureError::is_recoverable`] tells callers
//! whether the session can keep going.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command channel unavailable, dropped '{op}'")]
    ChannelUnavailable { op: String },

    #[error("Malformed worker message: {0}")]
    Protocol(String),

    #[error("Frame buffer error: {0}")]
    Buffer(String),

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Not allowed while {state}: {reason}")]
    State { state: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Telemetry block too short: got {len} bytes, need {required}")]
    TelemetryParse { len: usize, required: usize },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Gain LUT cache error: {0}")]
    Lut(String),
}

impl CaptureError {
    /// Build a [`CaptureError::State`] from anything printable.
    pub fn state(state: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        CaptureError::State {
            state: state.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CaptureError::Config(_) | CaptureError::Configuration(_) | CaptureError::Io(_)
        )
    }

    /// True for the shape-versus-bytes family (`Buffer` and `FrameSize`).
    pub fn is_buffer_error(&self) -> bool {
        matches!(self, CaptureError::Buffer(_) | CaptureError::FrameSize { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_are_recoverable() {
        let err = CaptureError::FrameSize {
            expected: 12,
            actual: 10,
        };
        assert!(err.is_recoverable());
        assert!(err.is_buffer_error());
        assert_eq!(
            err.to_string(),
            "Frame size mismatch: expected 12 bytes, got 10"
        );
    }

    #[test]
    fn startup_errors_are_fatal() {
        let err = CaptureError::Configuration("bad gain step".into());
        assert!(!err.is_recoverable());

        let io: CaptureError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(!io.is_recoverable());
    }

    #[test]
    fn state_error_names_the_state() {
        let err = CaptureError::state("Disconnected", "set_resolution requires a camera");
        assert_eq!(
            err.to_string(),
            "Not allowed while Disconnected: set_resolution requires a camera"
        );
        assert!(!err.is_buffer_error());
    }
}
