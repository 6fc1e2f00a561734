//! Color processing: gain lookup tables, software white balance, and debayer.

pub mod debayer;
pub mod lut;
pub mod white_balance;

pub use debayer::{debayer, BayerPattern};
pub use lut::{GainGrid, GainLut, GainLutCache};
pub use white_balance::{FrameStack, WhiteBalanceGains};
