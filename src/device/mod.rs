//! Tuner hardware access
//!
//! Driver traits, the simulated backend, the device session that owns an
//! open handle, and lifecycle state.

pub mod driver;
pub mod mock;
pub mod session;
pub mod state;

pub use driver::{DriverResult, RawBuffer, TunerDevice, TunerDriver};
pub use mock::{MockConfig, MockDevice, MockDriver};
pub use session::DeviceSession;
pub use state::{Configuration, RunState};
