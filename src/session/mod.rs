//! Camera session: geometry types and the mode state machine.

pub mod mode;
pub mod state_machine;

pub use mode::{
    Bin, BitDepth, Capabilities, ExposureSettings, ModeState, Roi, StreamingMode,
};
pub use state_machine::{
    ControlRequest, HandshakeStep, ModeStateMachine, SessionContext, SessionEvent,
};
