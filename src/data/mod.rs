//! Frame data path: shared regions, the drop-oldest mailbox, pixel decoding, and telemetry.
pub mod decoder;
pub mod frame_buffer;
pub mod mailbox;
pub mod telemetry;
