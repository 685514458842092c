//! Sample path from raw driver buffers to the host callback
//!
//! 1. Driver fills a raw buffer of interleaved 8-bit I/Q
//! 2. Convert each byte to a normalized float
//! 3. Deliver the float buffer to the registered callback

pub mod capture;
pub mod convert;
pub mod delivery;

pub use capture::{
    buffer_len, AcquisitionHandle, AcquisitionLoop, AcquisitionStats, CompletionSignal,
    LoopSettings, StatsSnapshot, StreamBuffer, MAX_CALLBACK_INTERVAL,
};
pub use convert::{Normalization, SampleConverter};
pub use delivery::{ContextCallback, Delivery, SampleCallback};
