//! Configuration loaded from environment variables

use std::time::Duration;

use crate::device::Configuration;
use crate::sdr::{LoopSettings, Normalization, MAX_CALLBACK_INTERVAL};

/// Adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Target period between callback deliveries
    pub callback_interval: Duration,

    /// Warm-up after opening the device, before the first read
    pub settle_delay: Duration,

    /// Raw byte scaling convention
    pub normalization: Normalization,

    /// Fraction of dropped samples per buffer accepted silently
    pub drop_tolerance: f64,

    /// How long `start` waits for a previous acquisition thread to exit
    pub join_timeout: Duration,

    /// Tuner settings applied at `init`
    pub defaults: Configuration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            callback_interval: Duration::from_millis(60),
            settle_delay: Duration::from_secs(1),
            normalization: Normalization::Corrected,
            drop_tolerance: 0.0,
            join_timeout: Duration::from_secs(2),
            defaults: Configuration::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl AdapterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let base = Self::default();
        let defaults = Configuration {
            sample_rate: env_parse("DEVICE_SAMPLE_RATE").unwrap_or(base.defaults.sample_rate),
            center_frequency: env_parse("DEVICE_FREQUENCY")
                .unwrap_or(base.defaults.center_frequency),
            gain_db: env_parse("DEVICE_GAIN").unwrap_or(base.defaults.gain_db),
            filter_bandwidth: None,
        };

        Self {
            callback_interval: env_parse("IQ_CALLBACK_INTERVAL_MS")
                .map(|ms| Duration::from_millis(ms).min(MAX_CALLBACK_INTERVAL))
                .unwrap_or(base.callback_interval),

            settle_delay: env_parse("DEVICE_SETTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.settle_delay),

            normalization: match std::env::var("IQ_LEGACY_SCALING").as_deref() {
                Ok("1") | Ok("true") => Normalization::Legacy,
                _ => base.normalization,
            },

            drop_tolerance: env_parse("IQ_DROP_TOLERANCE").unwrap_or(base.drop_tolerance),

            join_timeout: env_parse("STOP_JOIN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.join_timeout),

            defaults,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            callback_interval: self.callback_interval,
            normalization: self.normalization,
            drop_tolerance: self.drop_tolerance,
        }
    }
}
