//! Acquisition loop
//!
//! Runs the driver's blocking read on a dedicated thread, converts every raw
//! buffer into the stream buffer and hands it to the registered callback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use super::convert::{Normalization, SampleConverter};
use super::delivery::{Delivery, SampleCallback};
use crate::device::{RawBuffer, TunerDevice};
use crate::error::{Error, Result};

/// Driver transfers must be a multiple of this many bytes
pub const RAW_BUFFER_ALIGN: usize = 512;

/// Longest callback interval a stream buffer is sized for
pub const MAX_CALLBACK_INTERVAL: Duration = Duration::from_secs(1);

/// Raw bytes (and floats) per delivery for `rate` at `interval`.
///
/// Two units per complex sample, rounded up to the transfer alignment.
/// `interval` is clamped to [`MAX_CALLBACK_INTERVAL`].
pub fn buffer_len(rate: u32, interval: Duration) -> usize {
    let interval = interval.min(MAX_CALLBACK_INTERVAL);
    let units = (interval.as_secs_f64() * f64::from(rate) * 2.0) as usize;
    units.div_ceil(RAW_BUFFER_ALIGN).max(1) * RAW_BUFFER_ALIGN
}

/// Converted samples for one delivery, sized from the rate in effect when
/// acquisition started
#[derive(Debug)]
pub struct StreamBuffer {
    samples: Vec<f32>,
    rate: u32,
}

impl StreamBuffer {
    pub fn for_rate(rate: u32, interval: Duration) -> Self {
        Self {
            samples: vec![0.0; buffer_len(rate, interval)],
            rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    fn as_slice(&self) -> &[f32] {
        &self.samples
    }
}

/// Parameters for one acquisition run
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub callback_interval: Duration,
    pub normalization: Normalization,
    /// Fraction of dropped samples per buffer accepted without counting
    pub drop_tolerance: f64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            callback_interval: Duration::from_millis(60),
            normalization: Normalization::Corrected,
            drop_tolerance: 0.0,
        }
    }
}

/// Statistics for one acquisition run (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    pub buffers_delivered: AtomicU64,
    pub samples_delivered: AtomicU64,
    pub dropped_buffers: AtomicU64,
    pub dropped_samples: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`AcquisitionStats`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub buffers_delivered: u64,
    pub samples_delivered: u64,
    pub dropped_buffers: u64,
    pub dropped_samples: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl AcquisitionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mark_started(&self) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            buffers_delivered: self.buffers_delivered.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            dropped_buffers: self.dropped_buffers.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            started_at: *self.started_at.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Whether `dropped` samples ahead of a buffer of `received` raw units
/// exceed `tolerance`
fn drop_exceeds(dropped: u64, received: usize, tolerance: f64) -> bool {
    if dropped == 0 {
        return false;
    }
    let delivered = (received / 2) as f64;
    let fraction = dropped as f64 / (dropped as f64 + delivered);
    fraction > tolerance
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Completion signal for a running acquisition thread.
///
/// The worker holds the sending half of a channel and drops it on exit, so
/// every clone of the receiver observes the disconnect.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    done: Receiver<()>,
}

impl CompletionSignal {
    /// Wait up to `timeout` for the worker to exit. Returns `true` if it has.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

/// Handle to a spawned acquisition thread
#[derive(Debug)]
pub struct AcquisitionHandle {
    signal: CompletionSignal,
    thread: thread::JoinHandle<()>,
    buffer_len: usize,
    stats: Arc<AcquisitionStats>,
}

impl AcquisitionHandle {
    /// Length of the stream buffer this run delivers
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn stats(&self) -> &Arc<AcquisitionStats> {
        &self.stats
    }

    pub fn completion(&self) -> CompletionSignal {
        self.signal.clone()
    }

    /// Wait up to `timeout` for the thread to exit
    pub fn wait(&self, timeout: Duration) -> bool {
        self.signal.wait(timeout)
    }

    /// Block until the thread has exited
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| Error::Thread("acquisition thread panicked".to_string()))
    }
}

/// One acquisition run: device handle, stream buffer, converter, callback
pub struct AcquisitionLoop {
    device: Arc<dyn TunerDevice>,
    buffer: StreamBuffer,
    converter: SampleConverter,
    delivery: Delivery,
    drop_tolerance: f64,
    running: Arc<AtomicBool>,
    stats: Arc<AcquisitionStats>,
}

impl AcquisitionLoop {
    /// Build a run for the rate in effect now. The stream buffer is
    /// allocated here, never carried over from an earlier run.
    pub fn new(
        device: Arc<dyn TunerDevice>,
        rate: u32,
        settings: &LoopSettings,
        callback: Box<dyn SampleCallback>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let buffer = StreamBuffer::for_rate(rate, settings.callback_interval);
        debug!(
            "Stream buffer sized {} for {} S/s every {:?}",
            buffer.len(),
            rate,
            settings.callback_interval
        );
        Self {
            device,
            buffer,
            converter: SampleConverter::new(settings.normalization),
            delivery: Delivery::new(callback),
            drop_tolerance: settings.drop_tolerance,
            running,
            stats: AcquisitionStats::new(),
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Start the blocking read on its own thread. `on_exit` runs on that
    /// thread with the read result, before the completion signal fires. A
    /// panic in the callback ends the run with [`Error::Thread`].
    pub fn spawn<F>(self, on_exit: F) -> Result<AcquisitionHandle>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let (done_tx, done_rx) = bounded::<()>(0);
        let buffer_len = self.buffer.len();
        let stats = self.stats.clone();

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let exit_flag = self.running.clone();

        let thread = thread::Builder::new()
            .name("iq-acquisition".to_string())
            .spawn(move || {
                let _done = done_tx;
                let result = panic::catch_unwind(AssertUnwindSafe(|| self.run()))
                    .unwrap_or_else(|payload| {
                        exit_flag.store(false, Ordering::SeqCst);
                        Err(Error::Thread(format!(
                            "acquisition callback panicked: {}",
                            panic_message(&*payload)
                        )))
                    });
                if let Err(e) = &result {
                    error!("Acquisition error: {}", e);
                }
                on_exit(result);
            })
            .map_err(|e| {
                running.store(false, Ordering::SeqCst);
                Error::Thread(format!("failed to spawn acquisition thread: {}", e))
            })?;

        Ok(AcquisitionHandle {
            signal: CompletionSignal { done: done_rx },
            thread,
            buffer_len,
            stats,
        })
    }

    /// Main acquisition loop (runs in dedicated thread)
    fn run(self) -> Result<()> {
        let Self {
            device,
            mut buffer,
            converter,
            mut delivery,
            drop_tolerance,
            running,
            stats,
        } = self;

        let raw_len = buffer.len();
        info!(
            "Acquisition started: {} bytes per buffer at {} S/s ({:?} scaling)",
            raw_len,
            buffer.rate(),
            converter.normalization()
        );
        stats.mark_started();

        let mut first_data = true;
        let mut last_stats_time = Instant::now();

        let result = device.read_async(raw_len, &mut |raw: RawBuffer<'_>| {
            if !running.load(Ordering::SeqCst) {
                if let Err(e) = device.cancel_async() {
                    warn!("Cancel request failed: {}", e);
                }
                return;
            }

            if first_data {
                info!("First IQ data received ({} bytes)", raw.bytes.len());
                first_data = false;
            }

            let n = converter.convert(raw.bytes, buffer.as_mut_slice());

            if drop_exceeds(raw.dropped, raw.bytes.len(), drop_tolerance) {
                stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
                stats
                    .dropped_samples
                    .fetch_add(raw.dropped, Ordering::Relaxed);
                warn!("Driver dropped {} samples before this buffer", raw.dropped);
            } else if raw.dropped > 0 {
                debug!("Driver dropped {} samples (within tolerance)", raw.dropped);
            }

            delivery.deliver(&buffer.as_slice()[..n], raw.dropped);
            stats.buffers_delivered.fetch_add(1, Ordering::Relaxed);
            stats
                .samples_delivered
                .fetch_add((n / 2) as u64, Ordering::Relaxed);

            // Periodic stats logging (every 5 seconds)
            if last_stats_time.elapsed() >= Duration::from_secs(5) {
                let snap = stats.snapshot();
                info!(
                    "[Acquisition] Buffers: {} | Samples: {} | Dropped: {} in {} buffers",
                    snap.buffers_delivered,
                    snap.samples_delivered,
                    snap.dropped_samples,
                    snap.dropped_buffers
                );
                last_stats_time = Instant::now();
            }
        });

        running.store(false, Ordering::SeqCst);

        let snap = stats.snapshot();
        info!(
            "Acquisition stopped. Buffers={}, Samples={}, Dropped={}",
            delivery.delivered(),
            snap.samples_delivered,
            snap.dropped_samples
        );

        result.map_err(Error::from)
    }
}
