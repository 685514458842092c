//! Error types for the acquisition adapter and the tuner driver boundary

use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a tuner driver.
///
/// Mirrors the negative return codes of the librtlsdr C API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Driver rejected an argument (-EINVAL)
    #[error("invalid argument")]
    InvalidArgument,

    /// No device at the requested index
    #[error("device not found")]
    NotFound,

    /// Device already claimed by another session
    #[error("device busy")]
    Busy,

    /// USB transfer or control request failed
    #[error("I/O failure: {0}")]
    Io(String),

    /// Blocking read ended because of a cancellation request
    #[error("read cancelled")]
    Cancelled,

    /// Any other negative return code
    #[error("driver returned {0}")]
    Other(i32),
}

/// Errors surfaced by the device session and lifecycle controller
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or rejected plugin parameter string
    #[error("Parameters wrong: {0}")]
    ParametersWrong(String),

    /// Device could not be opened or brought into its initial configuration
    #[error("Cannot open device: {0}")]
    CannotOpenDevice(String),

    /// Hardware rejected the requested sample rate
    #[error("Invalid sample rate: {0} S/s")]
    InvalidSampleRate(u32),

    /// Hardware failed to tune
    #[error("Cannot set frequency: {0} Hz")]
    CannotSetFrequency(u32),

    /// Hardware failed to apply gain
    #[error("Cannot set tuner gain: {0:.1} dB")]
    CannotSetGain(f32),

    /// Sample rate changes are refused while samples are streaming
    #[error("Sample rate change requires stop (current rate {current} S/s)")]
    RateChangeRequiresStop { current: u32 },

    /// A stream is already running on this adapter
    #[error("Acquisition already running")]
    AlreadyRunning,

    /// Operation issued before `init`
    #[error("Plugin not initialized")]
    NotInitialized,

    /// Operation issued after the device handle was released
    #[error("Device closed")]
    DeviceClosed,

    /// Driver failure outside the specific cases above
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// The acquisition thread could not be spawned or died in the callback
    #[error("Thread error: {0}")]
    Thread(String),
}

impl Error {
    /// Fold a configuration failure during `init` into `CannotOpenDevice`,
    /// keeping the original message.
    pub fn into_open_failure(self) -> Self {
        match self {
            Error::CannotOpenDevice(_) | Error::ParametersWrong(_) => self,
            other => Error::CannotOpenDevice(other.to_string()),
        }
    }
}
