//! Host-facing status codes
//!
//! Numeric values follow the TSDR plugin code table so a thin export layer can
//! pass them through unchanged.

use crate::error::{DriverError, Error};

/// Status code reported to the host alongside a human-readable message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    ErrPlugin = 1,
    AlreadyRunning = 3,
    PluginParametersWrong = 4,
    SampleRateWrong = 5,
    CannotOpenDevice = 6,
    InvalidParameter = 8,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Collapse a result into the code the host expects
    pub fn from_result<T>(result: &crate::Result<T>) -> Self {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(e) => e.into(),
        }
    }
}

impl From<&Error> for StatusCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::ParametersWrong(_) => StatusCode::PluginParametersWrong,
            Error::CannotOpenDevice(_) => StatusCode::CannotOpenDevice,
            Error::InvalidSampleRate(_) | Error::RateChangeRequiresStop { .. } => {
                StatusCode::SampleRateWrong
            }
            Error::CannotSetFrequency(_) | Error::CannotSetGain(_) => StatusCode::InvalidParameter,
            Error::Driver(DriverError::InvalidArgument) => StatusCode::InvalidParameter,
            Error::AlreadyRunning => StatusCode::AlreadyRunning,
            Error::NotInitialized
            | Error::DeviceClosed
            | Error::Driver(_)
            | Error::Thread(_) => StatusCode::ErrPlugin,
        }
    }
}
