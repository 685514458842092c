//! Lifecycle state and requested tuner configuration

use std::fmt;

/// Lifecycle of one adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Configured,
    Streaming,
    Stopped,
    /// Terminal until the next `init`
    Closed,
}

impl RunState {
    /// States from which `start` is legal
    pub fn can_start(self) -> bool {
        matches!(self, RunState::Configured | RunState::Stopped)
    }

    /// States holding an open device session
    pub fn has_session(self) -> bool {
        matches!(
            self,
            RunState::Configured | RunState::Streaming | RunState::Stopped
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Uninitialized => "uninitialized",
            RunState::Configured => "configured",
            RunState::Streaming => "streaming",
            RunState::Stopped => "stopped",
            RunState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Requested tuner settings.
///
/// These are the values last asked for, not what the hardware applied; read
/// applied values back through the device session.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub sample_rate: u32,
    pub center_frequency: u32,
    /// Tuner gain in dB, quantized by the hardware
    pub gain_db: f32,
    /// IF filter bandwidth; `None` leaves the tuner default untouched
    pub filter_bandwidth: Option<u32>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            sample_rate: 2_560_000,
            center_frequency: 105_000_000,
            gain_db: 0.1,
            filter_bandwidth: None,
        }
    }
}
