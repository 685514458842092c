//! Simulated RTL2832U/R820T backend
//!
//! Reproduces the parts of the real driver the adapter depends on: sample
//! rate validation and quantization, tuner gain steps, tuning range, exclusive
//! open, and a blocking read loop that honours cancellation at buffer
//! boundaries. Buffers carry a synthetic tone so converted output is
//! non-trivial.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::driver::{DriverResult, RawBuffer, TunerDevice, TunerDriver};
use crate::error::DriverError;

/// RTL2832 reference crystal
const RTL_XTAL_FREQ: f64 = 28_800_000.0;

/// Supported R820T gain steps in tenths of a dB
const R820T_GAINS: [i32; 29] = [
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364,
    372, 386, 402, 421, 434, 439, 445, 480, 496,
];

const MIN_FREQUENCY: u32 = 24_000_000;
const MAX_FREQUENCY: u32 = 1_766_000_000;

/// Tone offset of the synthetic signal, as a fraction of the sample rate
const TONE_FRACTION: f64 = 0.05;

/// Behaviour knobs for the simulated backend
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Number of devices the driver reports
    pub device_count: u32,
    /// Sleep between buffers so delivery follows the configured sample rate
    pub realtime: bool,
    /// Round applied rates to a multiple of this many S/s
    pub rate_resolution: Option<u32>,
    /// Report a dropped buffer's worth of samples on every n-th buffer
    pub drop_every: Option<u64>,
    pub fail_frequency: bool,
    pub fail_gain: bool,
    /// Fail the blocking read after this many buffers
    pub fail_read_after: Option<u64>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            realtime: true,
            rate_resolution: None,
            drop_every: None,
            fail_frequency: false,
            fail_gain: false,
            fail_read_after: None,
        }
    }
}

#[derive(Debug, Default)]
struct DriverShared {
    open: Mutex<HashSet<u32>>,
    opens: AtomicU64,
}

impl DriverShared {
    fn release(&self, index: u32) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
    }
}

/// Driver handing out [`MockDevice`]s. Clones share open-device bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    config: MockConfig,
    shared: Arc<DriverShared>,
}

impl MockDriver {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            shared: Arc::new(DriverShared::default()),
        }
    }

    /// Whether a handle for `index` is currently held
    pub fn is_open(&self, index: u32) -> bool {
        self.shared
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&index)
    }

    pub fn open_devices(&self) -> usize {
        self.shared
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total successful opens since construction
    pub fn opens(&self) -> u64 {
        self.shared.opens.load(Ordering::Relaxed)
    }
}

impl TunerDriver for MockDriver {
    fn device_count(&self) -> u32 {
        self.config.device_count
    }

    fn device_name(&self, index: u32) -> Option<String> {
        (index < self.config.device_count).then(|| "Generic RTL2832U OEM (simulated)".to_string())
    }

    fn open(&self, index: u32) -> DriverResult<Box<dyn TunerDevice>> {
        if index >= self.config.device_count {
            return Err(DriverError::NotFound);
        }
        {
            let mut open = self.shared.open.lock().unwrap_or_else(PoisonError::into_inner);
            if !open.insert(index) {
                return Err(DriverError::Busy);
            }
        }
        self.shared.opens.fetch_add(1, Ordering::Relaxed);
        info!("Mock tuner {} opened", index);
        Ok(Box::new(MockDevice::new(
            index,
            self.config.clone(),
            self.shared.clone(),
        )))
    }
}

#[derive(Debug)]
struct Settings {
    rate: u32,
    freq: u32,
    manual_gain: bool,
    gain: i32,
    bandwidth: u32,
}

/// Clears the in-read flag on every exit from `read_async`, unwinding included
struct ReadGuard<'a>(&'a AtomicBool);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One open simulated tuner
pub struct MockDevice {
    index: u32,
    config: MockConfig,
    shared: Arc<DriverShared>,
    settings: Mutex<Settings>,
    cancel: AtomicBool,
    reading: AtomicBool,
    closed: AtomicBool,
}

impl MockDevice {
    fn new(index: u32, config: MockConfig, shared: Arc<DriverShared>) -> Self {
        Self {
            index,
            config,
            shared,
            settings: Mutex::new(Settings {
                rate: 0,
                freq: 0,
                manual_gain: false,
                gain: 0,
                bandwidth: 0,
            }),
            cancel: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn settings(&self) -> DriverResult<std::sync::MutexGuard<'_, Settings>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Io("device closed".to_string()));
        }
        Ok(self.settings.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rate the RTL2832 resampler ends up at for a request of `rate`
    pub fn quantize_rate(rate: u32) -> DriverResult<u32> {
        if rate <= 225_000 || rate > 3_200_000 || (rate > 300_000 && rate <= 900_000) {
            return Err(DriverError::InvalidArgument);
        }
        let xtal = RTL_XTAL_FREQ * f64::from(1u32 << 22);
        let ratio = ((xtal / f64::from(rate)) as u32) & 0x0fff_fffc;
        let real_ratio = ratio | ((ratio & 0x0800_0000) << 1);
        Ok((xtal / f64::from(real_ratio)) as u32)
    }

    fn nearest_gain(tenth_db: i32) -> i32 {
        R820T_GAINS
            .iter()
            .copied()
            .min_by_key(|g| (g - tenth_db).abs())
            .unwrap_or(0)
    }

    fn fill(buffer: &mut [u8], phase: &mut f64, step: f64) {
        for pair in buffer.chunks_exact_mut(2) {
            pair[0] = (127.5 + 100.0 * phase.cos()) as u8;
            pair[1] = (127.5 + 100.0 * phase.sin()) as u8;
            *phase = (*phase + step) % (2.0 * PI);
        }
    }
}

impl TunerDevice for MockDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()> {
        let mut applied = Self::quantize_rate(rate)?;
        if let Some(step) = self.config.rate_resolution.filter(|s| *s > 0) {
            applied = (applied + step / 2) / step * step;
        }
        debug!("Mock tuner {}: rate {} -> {}", self.index, rate, applied);
        self.settings()?.rate = applied;
        Ok(())
    }

    fn sample_rate(&self) -> DriverResult<u32> {
        Ok(self.settings()?.rate)
    }

    fn set_center_freq(&self, freq: u32) -> DriverResult<()> {
        if self.config.fail_frequency || !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&freq) {
            return Err(DriverError::Other(-1));
        }
        self.settings()?.freq = freq;
        Ok(())
    }

    fn center_freq(&self) -> DriverResult<u32> {
        Ok(self.settings()?.freq)
    }

    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult<()> {
        self.settings()?.manual_gain = manual;
        Ok(())
    }

    fn set_tuner_gain(&self, tenth_db: i32) -> DriverResult<()> {
        if self.config.fail_gain {
            return Err(DriverError::Other(-1));
        }
        self.settings()?.gain = Self::nearest_gain(tenth_db);
        Ok(())
    }

    fn tuner_gain(&self) -> DriverResult<i32> {
        Ok(self.settings()?.gain)
    }

    fn tuner_gains(&self) -> Vec<i32> {
        R820T_GAINS.to_vec()
    }

    fn set_tuner_bandwidth(&self, bandwidth: u32) -> DriverResult<()> {
        self.settings()?.bandwidth = bandwidth;
        Ok(())
    }

    fn read_async(
        &self,
        buf_len: usize,
        handler: &mut dyn FnMut(RawBuffer<'_>),
    ) -> DriverResult<()> {
        if buf_len == 0 {
            return Err(DriverError::InvalidArgument);
        }
        let rate = self.settings()?.rate;
        if rate == 0 {
            return Err(DriverError::InvalidArgument);
        }
        if self.reading.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Busy);
        }
        let _reading = ReadGuard(&self.reading);
        self.cancel.store(false, Ordering::SeqCst);

        let pacing = Duration::from_secs_f64((buf_len / 2) as f64 / f64::from(rate));
        let step = 2.0 * PI * TONE_FRACTION;
        let mut phase = 0.0;
        let mut buffer = vec![0u8; buf_len];
        let mut count = 0u64;
        let mut result = Ok(());

        while !self.cancel.load(Ordering::SeqCst) {
            if self.closed.load(Ordering::SeqCst) {
                result = Err(DriverError::Io("device closed".to_string()));
                break;
            }
            if self.config.fail_read_after.is_some_and(|n| count >= n) {
                result = Err(DriverError::Io("bulk transfer failed".to_string()));
                break;
            }
            Self::fill(&mut buffer, &mut phase, step);
            let dropped = match self.config.drop_every {
                Some(n) if n > 0 && count % n == n - 1 => (buf_len / 2) as u64,
                _ => 0,
            };
            handler(RawBuffer {
                bytes: &buffer,
                dropped,
            });
            count += 1;
            if self.config.realtime {
                thread::sleep(pacing);
            }
        }

        debug!("Mock tuner {}: read loop exited after {} buffers", self.index, count);
        result
    }

    fn cancel_async(&self) -> DriverResult<()> {
        self.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.store(true, Ordering::SeqCst);
            self.shared.release(self.index);
            info!("Mock tuner {} closed", self.index);
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.close();
    }
}
