//! RTL-SDR acquisition plugin
//!
//! Bridges an SDR host to an RTL2832U tuner: owns the device handle, runs the
//! driver's blocking read on its own thread, converts raw 8-bit I/Q into
//! normalized floats and hands each buffer to a host callback.
//!
//! ```no_run
//! use rtlsdr_plugin::{AdapterConfig, MockDriver, RtlSdrPlugin};
//!
//! let plugin = RtlSdrPlugin::new(MockDriver::default(), AdapterConfig::default());
//! plugin.init("--rate=2048000 --index=0")?;
//! plugin.set_center_frequency(100_000_000)?;
//! let handle = plugin.start(|samples: &[f32], _dropped: u64| {
//!     println!("{} floats", samples.len());
//! })?;
//! plugin.stop()?;
//! handle.join()?;
//! plugin.cleanup();
//! # Ok::<(), rtlsdr_plugin::Error>(())
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod params;
pub mod plugin;
pub mod sdr;
pub mod status;

pub use config::AdapterConfig;
pub use device::{
    Configuration, DeviceSession, MockConfig, MockDriver, RunState, TunerDevice, TunerDriver,
};
pub use error::{DriverError, Error, Result};
pub use params::InitParams;
pub use plugin::{RtlSdrPlugin, PLUGIN_NAME};
pub use sdr::{AcquisitionHandle, Normalization, SampleCallback, SampleConverter, StatsSnapshot};
pub use status::StatusCode;
