//! Lifecycle controller - the surface the host drives
//!
//! Call order: `init` → configure → `read_async`/`start` → `stop` →
//! (`start` again) → `cleanup`. Every method takes `&self` so `stop` can be
//! issued from another thread while `read_async` blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::device::{Configuration, DeviceSession, RunState, TunerDriver};
use crate::error::{Error, Result};
use crate::params::InitParams;
use crate::sdr::{
    AcquisitionHandle, AcquisitionLoop, AcquisitionStats, CompletionSignal, SampleCallback,
    StatsSnapshot,
};
use crate::status::StatusCode;

/// Static identifier reported to the host
pub const PLUGIN_NAME: &str = "TSDR RTLSDR Compatible Plugin";

struct Inner {
    state: RunState,
    session: Option<DeviceSession>,
    requested: Configuration,
    /// Bumped on every start so a stale worker cannot touch a newer stream
    generation: u64,
    running: Option<Arc<AtomicBool>>,
    completion: Option<CompletionSignal>,
    stats: Option<Arc<AcquisitionStats>>,
    buffer_len: Option<usize>,
    exit_error: Option<(u64, Error)>,
}

impl Inner {
    fn session(&mut self) -> Result<&mut DeviceSession> {
        if self.state == RunState::Closed {
            return Err(Error::DeviceClosed);
        }
        if !self.state.has_session() {
            return Err(Error::NotInitialized);
        }
        match self.session.as_mut() {
            Some(session) if session.is_open() => Ok(session),
            Some(_) => Err(Error::DeviceClosed),
            None => Err(Error::NotInitialized),
        }
    }

    fn signal_stop(&mut self) {
        if let Some(running) = &self.running {
            running.store(false, Ordering::SeqCst);
        }
        if let Some(session) = &self.session {
            session.cancel();
        }
        if self.state == RunState::Streaming {
            self.state = RunState::Stopped;
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    last_error: Mutex<Option<(StatusCode, String)>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, err: &Error) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((StatusCode::from(err), err.to_string()));
    }

    /// Called on the acquisition thread when its read returns
    fn finish(&self, generation: u64, result: Result<()>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if inner.state == RunState::Streaming {
            info!("Acquisition ended without stop request");
            inner.state = RunState::Stopped;
        }
        if let Err(e) = result {
            self.set_last_error(&e);
            inner.exit_error = Some((generation, e));
        }
    }
}

/// RTL-SDR acquisition adapter. One instance owns at most one device.
pub struct RtlSdrPlugin {
    driver: Arc<dyn TunerDriver>,
    config: AdapterConfig,
    shared: Arc<Shared>,
}

impl RtlSdrPlugin {
    pub fn new<D: TunerDriver + 'static>(driver: D, config: AdapterConfig) -> Self {
        Self::with_driver(Arc::new(driver), config)
    }

    pub fn with_driver(driver: Arc<dyn TunerDriver>, config: AdapterConfig) -> Self {
        let requested = config.defaults.clone();
        Self {
            driver,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: RunState::Uninitialized,
                    session: None,
                    requested,
                    generation: 0,
                    running: None,
                    completion: None,
                    stats: None,
                    buffer_len: None,
                    exit_error: None,
                }),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }

    /// Last failure as the (code, message) pair the host reads out of band
    pub fn last_error(&self) -> Option<(StatusCode, String)> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("{}", e);
            self.shared.set_last_error(e);
        }
        result
    }

    /// Parse `params`, open the device and apply the initial configuration.
    ///
    /// Any session from an earlier `init` is released first, after its
    /// acquisition thread has exited. The settle delay runs without holding
    /// the state lock. On failure no device handle is left open.
    pub fn init(&self, params: &str) -> Result<()> {
        let result = self.init_inner(params);
        self.record(result)
    }

    fn init_inner(&self, params: &str) -> Result<()> {
        let parsed = InitParams::parse(params)?;

        let (generation, previous, completion, mut requested) = {
            let mut inner = self.shared.lock();
            if inner.state == RunState::Streaming {
                return Err(Error::AlreadyRunning);
            }
            inner.signal_stop();
            // A worker from the old session must not touch the new one
            inner.generation += 1;
            inner.state = RunState::Uninitialized;
            inner.running = None;
            (
                inner.generation,
                inner.session.take(),
                inner.completion.take(),
                inner.requested.clone(),
            )
        };

        if let Some(completion) = completion {
            if !completion.wait(self.config.join_timeout) {
                warn!("Previous acquisition thread still running at re-init");
            }
        }
        if let Some(mut old) = previous {
            debug!("Re-initializing: releasing device {}", old.index());
            old.close();
        }

        if let Some(rate) = parsed.rate {
            requested.sample_rate = rate;
        }
        requested.filter_bandwidth = parsed.bandwidth;

        info!(
            "Initializing device {}: {} S/s, {} Hz, {:.1} dB",
            parsed.index, requested.sample_rate, requested.center_frequency, requested.gain_db
        );

        let mut session = DeviceSession::open(self.driver.as_ref(), parsed.index)?;
        session.apply(&requested).map_err(Error::into_open_failure)?;
        session.settle(self.config.settle_delay);

        let mut inner = self.shared.lock();
        if inner.generation != generation || inner.state != RunState::Uninitialized {
            drop(inner);
            session.close();
            return Err(Error::CannotOpenDevice(
                "initialization interrupted by cleanup or another init".to_string(),
            ));
        }
        inner.requested = requested;
        inner.session = Some(session);
        inner.state = RunState::Configured;
        info!("Device {} configured", parsed.index);
        Ok(())
    }

    /// Run `f` under the state lock and record any failure
    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let result = {
            let mut inner = self.shared.lock();
            f(&mut inner)
        };
        self.record(result)
    }

    /// Request a new sample rate and return the applied one.
    ///
    /// Refused while streaming: the stream buffer is sized from the rate at
    /// start, so a live change needs stop and start.
    pub fn set_sample_rate(&self, rate: u32) -> Result<u32> {
        self.with_inner(|inner| {
            if inner.state == RunState::Streaming {
                let current = inner.session()?.sample_rate()?;
                return Err(Error::RateChangeRequiresStop { current });
            }
            let applied = inner.session()?.set_sample_rate(rate)?;
            inner.requested.sample_rate = rate;
            Ok(applied)
        })
    }

    /// Sample rate in effect on the hardware
    pub fn sample_rate(&self) -> Result<u32> {
        self.with_inner(|inner| inner.session()?.sample_rate())
    }

    /// Retune. Takes effect live while streaming.
    pub fn set_center_frequency(&self, freq: u32) -> Result<()> {
        self.with_inner(|inner| {
            inner.session()?.set_center_frequency(freq)?;
            inner.requested.center_frequency = freq;
            Ok(())
        })
    }

    pub fn center_frequency(&self) -> Result<u32> {
        self.with_inner(|inner| inner.session()?.center_frequency())
    }

    /// Set tuner gain in dB and return the applied step. Takes effect live.
    pub fn set_gain(&self, gain_db: f32) -> Result<f32> {
        self.with_inner(|inner| {
            let applied = inner.session()?.set_gain(gain_db)?;
            inner.requested.gain_db = gain_db;
            Ok(applied)
        })
    }

    pub fn gain(&self) -> Result<f32> {
        self.with_inner(|inner| inner.session()?.gain())
    }

    /// Gain steps the tuner supports, in dB
    pub fn gains(&self) -> Result<Vec<f32>> {
        self.with_inner(|inner| inner.session()?.gains())
    }

    pub fn set_filter_bandwidth(&self, bandwidth: u32) -> Result<()> {
        self.with_inner(|inner| {
            inner.session()?.set_filter_bandwidth(bandwidth)?;
            inner.requested.filter_bandwidth = Some(bandwidth);
            Ok(())
        })
    }

    /// Start streaming on a dedicated thread and return immediately.
    ///
    /// The stream buffer is sized from the hardware rate at this moment. If a
    /// previous acquisition thread is still winding down, waits up to the
    /// configured join timeout for it.
    pub fn start<C: SampleCallback + 'static>(&self, callback: C) -> Result<AcquisitionHandle> {
        let result = self.start_inner(Box::new(callback));
        self.record(result)
    }

    fn check_startable(state: RunState) -> Result<()> {
        if state.can_start() {
            return Ok(());
        }
        Err(match state {
            RunState::Streaming => Error::AlreadyRunning,
            RunState::Closed => Error::DeviceClosed,
            _ => Error::NotInitialized,
        })
    }

    fn start_inner(&self, callback: Box<dyn SampleCallback>) -> Result<AcquisitionHandle> {
        let previous = {
            let inner = self.shared.lock();
            Self::check_startable(inner.state)?;
            inner.completion.clone()
        };
        if let Some(previous) = previous {
            if !previous.wait(self.config.join_timeout) {
                warn!(
                    "Previous acquisition thread still running after {:?}",
                    self.config.join_timeout
                );
                return Err(Error::AlreadyRunning);
            }
        }

        let mut inner = self.shared.lock();
        Self::check_startable(inner.state)?;

        let session = inner.session()?;
        let device = session.handle()?;
        let rate = session.sample_rate()?;

        inner.generation += 1;
        let generation = inner.generation;
        inner.exit_error = None;

        let running = Arc::new(AtomicBool::new(false));
        let acquisition = AcquisitionLoop::new(
            device,
            rate,
            &self.config.loop_settings(),
            callback,
            running.clone(),
        );

        let shared = self.shared.clone();
        let handle = acquisition.spawn(move |result| shared.finish(generation, result))?;

        inner.state = RunState::Streaming;
        inner.running = Some(running);
        inner.completion = Some(handle.completion());
        inner.stats = Some(handle.stats().clone());
        inner.buffer_len = Some(handle.buffer_len());
        info!(
            "Streaming started at {} S/s, {} samples per callback",
            rate,
            handle.buffer_len()
        );
        Ok(handle)
    }

    /// Stream until `stop` is called from another thread or the driver fails.
    /// Blocks the calling thread for the whole acquisition.
    pub fn read_async<C: SampleCallback + 'static>(&self, callback: C) -> Result<()> {
        let handle = self.start(callback)?;
        let generation = self.shared.lock().generation;
        handle.join()?;

        let exit = {
            let mut inner = self.shared.lock();
            match inner.exit_error.take() {
                Some((g, e)) if g == generation => Some(e),
                other => {
                    inner.exit_error = other;
                    None
                }
            }
        };
        match exit {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Request the acquisition to stop. Does not wait for the thread; use the
    /// handle from `start` or [`RtlSdrPlugin::wait_stopped`] for that.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.state == RunState::Streaming {
            info!("Stopping acquisition");
        }
        inner.signal_stop();
        Ok(())
    }

    /// Wait up to `timeout` for the acquisition thread to exit
    pub fn wait_stopped(&self, timeout: std::time::Duration) -> bool {
        let completion = self.shared.lock().completion.clone();
        completion.map_or(true, |c| c.wait(timeout))
    }

    /// Stats of the current or most recent stream
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.shared.lock().stats.as_ref().map(|s| s.snapshot())
    }

    /// Stream buffer length of the current or most recent stream
    pub fn buffer_len(&self) -> Option<usize> {
        self.shared.lock().buffer_len
    }

    /// Stop streaming, release the device and buffers. Idempotent and safe
    /// from any state.
    pub fn cleanup(&self) {
        let completion = {
            let mut inner = self.shared.lock();
            inner.signal_stop();
            inner.completion.take()
        };
        if let Some(completion) = completion {
            if !completion.wait(self.config.join_timeout) {
                warn!("Acquisition thread did not exit before cleanup");
            }
        }

        let mut inner = self.shared.lock();
        if let Some(mut session) = inner.session.take() {
            session.close();
        }
        inner.running = None;
        if inner.state != RunState::Closed {
            debug!("Plugin state {} -> closed", inner.state);
        }
        inner.state = RunState::Closed;
    }
}

impl Drop for RtlSdrPlugin {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockConfig, MockDriver};
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> AdapterConfig {
        AdapterConfig {
            settle_delay: Duration::ZERO,
            callback_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn plugin(mock: MockConfig) -> (RtlSdrPlugin, MockDriver) {
        let driver = MockDriver::new(mock);
        (RtlSdrPlugin::new(driver.clone(), config()), driver)
    }

    #[test]
    fn test_name() {
        let (plugin, _) = plugin(MockConfig::default());
        assert_eq!(plugin.name(), "TSDR RTLSDR Compatible Plugin");
    }

    #[test]
    fn test_calls_before_init() {
        let (plugin, _) = plugin(MockConfig::default());
        assert!(matches!(plugin.sample_rate(), Err(Error::NotInitialized)));
        assert!(matches!(plugin.set_gain(10.0), Err(Error::NotInitialized)));
        assert!(matches!(
            plugin.start(|_: &[f32], _: u64| {}),
            Err(Error::NotInitialized)
        ));
        assert!(plugin.stop().is_ok());
        let (code, _) = plugin.last_error().unwrap();
        assert_eq!(code, StatusCode::ErrPlugin);
    }

    #[test]
    fn test_malformed_init_leaves_no_handle() {
        let (plugin, driver) = plugin(MockConfig::default());
        let err = plugin.init("--rate=abc").unwrap_err();
        assert_eq!(StatusCode::from(&err), StatusCode::PluginParametersWrong);
        assert_eq!(driver.open_devices(), 0);
        assert_eq!(plugin.state(), RunState::Uninitialized);
        let (code, msg) = plugin.last_error().unwrap();
        assert_eq!(code, StatusCode::PluginParametersWrong);
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_hardware_failure_during_init_releases_device() {
        let (plugin, driver) = plugin(MockConfig {
            fail_frequency: true,
            ..Default::default()
        });
        let err = plugin.init("--rate=2048000").unwrap_err();
        assert!(matches!(err, Error::CannotOpenDevice(_)));
        assert_eq!(driver.opens(), 1);
        assert_eq!(driver.open_devices(), 0);

        let (plugin, driver) = self::plugin(MockConfig::default());
        let err = plugin.init("--rate=500000").unwrap_err();
        assert_eq!(StatusCode::from(&err), StatusCode::CannotOpenDevice);
        assert_eq!(driver.open_devices(), 0);
    }

    #[test]
    fn test_missing_device() {
        let (plugin, _) = plugin(MockConfig::default());
        let err = plugin.init("--index=3").unwrap_err();
        assert!(matches!(err, Error::CannotOpenDevice(_)));
    }

    #[test]
    fn test_applied_rate_readback() {
        let (plugin, _) = plugin(MockConfig {
            rate_resolution: Some(10_000),
            ..Default::default()
        });
        plugin.init("").unwrap();
        assert_eq!(plugin.sample_rate().unwrap(), 2_560_000);
        let applied = plugin.set_sample_rate(1_234_567).unwrap();
        assert_eq!(applied, 1_230_000);
        assert_eq!(plugin.sample_rate().unwrap(), 1_230_000);
    }

    #[test]
    fn test_rate_change_rejected_while_streaming() {
        let (plugin, _) = plugin(MockConfig::default());
        plugin.init("--rate=1024000").unwrap();
        let handle = plugin.start(|_: &[f32], _: u64| {}).unwrap();
        let err = plugin.set_sample_rate(2_048_000).unwrap_err();
        assert!(matches!(
            err,
            Error::RateChangeRequiresStop { current: 1_024_000 }
        ));
        assert!(matches!(
            plugin.start(|_: &[f32], _: u64| {}),
            Err(Error::AlreadyRunning)
        ));

        // Frequency and gain stay live
        plugin.set_center_frequency(433_920_000).unwrap();
        assert_eq!(plugin.center_frequency().unwrap(), 433_920_000);
        assert!((plugin.set_gain(40.0).unwrap() - 40.2).abs() < 1e-4);

        plugin.stop().unwrap();
        assert!(handle.wait(Duration::from_secs(1)));
        assert_eq!(plugin.state(), RunState::Stopped);
        assert_eq!(plugin.set_sample_rate(2_048_000).unwrap(), 2_048_000);
    }

    #[test]
    fn test_buffer_resized_between_starts() {
        let (plugin, _) = plugin(MockConfig::default());
        plugin.init("--rate=1024000").unwrap();

        let first = plugin.start(|_: &[f32], _: u64| {}).unwrap();
        let first_len = first.buffer_len();
        plugin.stop().unwrap();
        assert!(first.wait(Duration::from_secs(1)));

        plugin.set_sample_rate(2_048_000).unwrap();
        let second = plugin.start(|_: &[f32], _: u64| {}).unwrap();
        assert_eq!(second.buffer_len(), first_len * 2);
        assert_eq!(plugin.buffer_len(), Some(second.buffer_len()));
        plugin.stop().unwrap();
        assert!(second.wait(Duration::from_secs(1)));
    }

    #[test]
    fn test_driver_failure_stops_stream() {
        let (plugin, _) = plugin(MockConfig {
            realtime: false,
            fail_read_after: Some(3),
            ..Default::default()
        });
        plugin.init("--rate=2048000").unwrap();
        let err = plugin.read_async(|_: &[f32], _: u64| {}).unwrap_err();
        assert!(matches!(err, Error::Driver(_)));
        assert_eq!(plugin.state(), RunState::Stopped);
        assert_eq!(plugin.stats().unwrap().buffers_delivered, 3);
        assert!(plugin.last_error().is_some());
    }

    #[test]
    fn test_cleanup_twice_and_after() {
        let (plugin, driver) = plugin(MockConfig::default());
        plugin.cleanup();
        plugin.init("").unwrap();
        assert!(driver.is_open(0));
        plugin.cleanup();
        plugin.cleanup();
        assert!(!driver.is_open(0));
        assert_eq!(plugin.state(), RunState::Closed);
        assert!(matches!(plugin.sample_rate(), Err(Error::DeviceClosed)));
        assert!(matches!(
            plugin.start(|_: &[f32], _: u64| {}),
            Err(Error::DeviceClosed)
        ));

        plugin.init("--index=0").unwrap();
        assert_eq!(plugin.state(), RunState::Configured);
    }

    #[test]
    fn test_reinit_releases_previous_session() {
        let (plugin, driver) = plugin(MockConfig {
            device_count: 2,
            ..Default::default()
        });
        plugin.init("--index=0").unwrap();
        plugin.init("--index=1 --bw=350000").unwrap();
        assert!(!driver.is_open(0));
        assert!(driver.is_open(1));
        assert_eq!(driver.open_devices(), 1);
    }

    #[test]
    fn test_rate_survives_reinit() {
        let (plugin, _) = plugin(MockConfig::default());
        plugin.init("--rate=1024000").unwrap();
        plugin.init("").unwrap();
        assert_eq!(plugin.sample_rate().unwrap(), 1_024_000);
    }

    #[test]
    fn test_gain_steps() {
        let (plugin, _) = plugin(MockConfig::default());
        assert!(matches!(plugin.gains(), Err(Error::NotInitialized)));
        plugin.init("").unwrap();
        let gains = plugin.gains().unwrap();
        assert_eq!(gains.first(), Some(&0.0));
        assert!(gains.contains(&49.6));
    }

    #[test]
    fn test_callback_panic_stops_stream() {
        let (plugin, _) = plugin(MockConfig {
            realtime: false,
            ..Default::default()
        });
        plugin.init("--rate=1024000").unwrap();
        let err = plugin
            .read_async(|_: &[f32], _: u64| panic!("host callback failed"))
            .unwrap_err();
        assert!(matches!(err, Error::Thread(_)));
        assert_eq!(plugin.state(), RunState::Stopped);
        let (code, msg) = plugin.last_error().unwrap();
        assert_eq!(code, StatusCode::ErrPlugin);
        assert!(msg.contains("host callback failed"));

        let (tx, rx) = bounded::<usize>(4);
        let handle = plugin
            .start(move |samples: &[f32], _: u64| {
                let _ = tx.try_send(samples.len());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        plugin.stop().unwrap();
        assert!(handle.wait(Duration::from_secs(1)));
        handle.join().unwrap();
    }

    #[test]
    fn test_start_gives_up_on_busy_previous_worker() {
        let plugin = RtlSdrPlugin::new(
            MockDriver::new(MockConfig::default()),
            AdapterConfig {
                join_timeout: Duration::from_millis(20),
                ..config()
            },
        );
        plugin.init("--rate=1024000").unwrap();

        let (entered_tx, entered_rx) = bounded::<()>(1);
        let first = plugin
            .start(move |_: &[f32], _: u64| {
                let _ = entered_tx.try_send(());
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        plugin.stop().unwrap();

        let started = Instant::now();
        assert!(matches!(
            plugin.start(|_: &[f32], _: u64| {}),
            Err(Error::AlreadyRunning)
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(plugin.state(), RunState::Stopped);

        assert!(first.wait(Duration::from_secs(1)));
        let second = plugin.start(|_: &[f32], _: u64| {}).unwrap();
        plugin.stop().unwrap();
        assert!(second.wait(Duration::from_secs(1)));
    }

    #[test]
    fn test_init_settles_without_holding_state() {
        let plugin = Arc::new(RtlSdrPlugin::new(
            MockDriver::default(),
            AdapterConfig {
                settle_delay: Duration::from_millis(200),
                ..config()
            },
        ));
        let started = Instant::now();
        let init = {
            let plugin = plugin.clone();
            thread::spawn(move || plugin.init(""))
        };

        thread::sleep(Duration::from_millis(50));
        let queried = Instant::now();
        assert_eq!(plugin.state(), RunState::Uninitialized);
        assert!(plugin.stop().is_ok());
        assert!(queried.elapsed() < Duration::from_millis(100));

        init.join().unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(plugin.state(), RunState::Configured);
    }

    #[test]
    fn test_reinit_waits_for_previous_worker() {
        let (plugin, driver) = plugin(MockConfig::default());
        plugin.init("--rate=1024000").unwrap();

        let (entered_tx, entered_rx) = bounded::<()>(1);
        let handle = plugin
            .start(move |_: &[f32], _: u64| {
                let _ = entered_tx.try_send(());
                thread::sleep(Duration::from_millis(100));
            })
            .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        plugin.stop().unwrap();

        plugin.init("--rate=2048000").unwrap();
        assert!(handle.wait(Duration::ZERO));
        assert_eq!(plugin.state(), RunState::Configured);
        assert_eq!(plugin.sample_rate().unwrap(), 2_048_000);
        assert_eq!(driver.open_devices(), 1);
    }
}
