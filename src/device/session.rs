//! Device session - exclusive owner of one open tuner handle

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::driver::{TunerDevice, TunerDriver};
use super::state::Configuration;
use crate::error::{DriverError, Error, Result};

/// Open tuner plus the bookkeeping needed to configure it.
///
/// The handle is shared with the acquisition thread while streaming; once
/// [`DeviceSession::close`] runs every operation fails with
/// [`Error::DeviceClosed`].
pub struct DeviceSession {
    index: u32,
    device: Option<Arc<dyn TunerDevice>>,
    manual_gain: bool,
}

impl DeviceSession {
    /// Acquire exclusive access to the tuner at `index`
    pub fn open(driver: &dyn TunerDriver, index: u32) -> Result<Self> {
        let device = driver.open(index).map_err(|e| match e {
            DriverError::NotFound => Error::CannotOpenDevice(format!(
                "no device at index {} ({} present)",
                index,
                driver.device_count()
            )),
            DriverError::Busy => Error::CannotOpenDevice(format!("device {} is busy", index)),
            other => Error::CannotOpenDevice(other.to_string()),
        })?;

        info!(
            "Opened device {}: {}",
            index,
            driver
                .device_name(index)
                .unwrap_or_else(|| "unknown".to_string())
        );

        Ok(Self {
            index,
            device: Some(Arc::from(device)),
            manual_gain: false,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn device(&self) -> Result<&Arc<dyn TunerDevice>> {
        self.device.as_ref().ok_or(Error::DeviceClosed)
    }

    /// Shared handle for the acquisition thread
    pub fn handle(&self) -> Result<Arc<dyn TunerDevice>> {
        self.device().cloned()
    }

    /// Apply a full configuration in driver order: rate, frequency, gain,
    /// then bandwidth when one was requested.
    pub fn apply(&mut self, config: &Configuration) -> Result<()> {
        self.set_sample_rate(config.sample_rate)?;
        self.set_center_frequency(config.center_frequency)?;
        self.set_gain(config.gain_db)?;
        if let Some(bw) = config.filter_bandwidth {
            self.set_filter_bandwidth(bw)?;
        }
        Ok(())
    }

    /// Hardware warm-up before the first read
    pub fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            debug!("Waiting {:?} for device {} to settle", delay, self.index);
            thread::sleep(delay);
        }
    }

    /// Request `rate` and return the rate the hardware applied
    pub fn set_sample_rate(&self, rate: u32) -> Result<u32> {
        self.device()?.set_sample_rate(rate).map_err(|e| match e {
            DriverError::InvalidArgument => Error::InvalidSampleRate(rate),
            other => Error::Driver(other),
        })?;
        let applied = self.sample_rate()?;
        if applied != rate {
            info!("Sample rate requested {} S/s, applied {} S/s", rate, applied);
        } else {
            debug!("Sample rate set to {} S/s", applied);
        }
        Ok(applied)
    }

    /// Rate currently in effect on the hardware
    pub fn sample_rate(&self) -> Result<u32> {
        Ok(self.device()?.sample_rate()?)
    }

    pub fn set_center_frequency(&self, freq: u32) -> Result<()> {
        self.device()?
            .set_center_freq(freq)
            .map_err(|_| Error::CannotSetFrequency(freq))?;
        debug!("Center frequency set to {} Hz", freq);
        Ok(())
    }

    pub fn center_frequency(&self) -> Result<u32> {
        Ok(self.device()?.center_freq()?)
    }

    /// Set manual gain. The tuner snaps to its nearest step; the applied gain
    /// in dB is returned.
    pub fn set_gain(&mut self, gain_db: f32) -> Result<f32> {
        let device = self.device()?.clone();
        if !self.manual_gain {
            device
                .set_tuner_gain_mode(true)
                .map_err(|_| Error::CannotSetGain(gain_db))?;
            self.manual_gain = true;
        }
        let tenths = (gain_db * 10.0).round() as i32;
        device
            .set_tuner_gain(tenths)
            .map_err(|_| Error::CannotSetGain(gain_db))?;
        let applied = self.gain()?;
        debug!("Gain requested {:.1} dB, applied {:.1} dB", gain_db, applied);
        Ok(applied)
    }

    /// Gain currently in effect, in dB
    pub fn gain(&self) -> Result<f32> {
        Ok(self.device()?.tuner_gain()? as f32 / 10.0)
    }

    /// Supported gain steps in dB
    pub fn gains(&self) -> Result<Vec<f32>> {
        Ok(self
            .device()?
            .tuner_gains()
            .into_iter()
            .map(|g| g as f32 / 10.0)
            .collect())
    }

    pub fn set_filter_bandwidth(&self, bandwidth: u32) -> Result<()> {
        self.device()?.set_tuner_bandwidth(bandwidth)?;
        debug!("IF filter bandwidth set to {} Hz", bandwidth);
        Ok(())
    }

    /// Ask a running blocking read to return. Failures are logged only.
    pub fn cancel(&self) {
        if let Some(device) = &self.device {
            if let Err(e) = device.cancel_async() {
                warn!("Cancel request on device {} failed: {}", self.index, e);
            }
        }
    }

    /// Release the handle. Idempotent.
    pub fn close(&mut self) {
        if let Some(device) = self.device.take() {
            device.cancel_async().ok();
            device.close();
            info!("Closed device {}", self.index);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
