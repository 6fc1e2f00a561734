//! Camera-side stand-ins for running the controller without a device.

pub mod mock;

pub use mock::{SimulatedCamera, SimulatedWorker};
