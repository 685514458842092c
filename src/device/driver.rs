//! Tuner driver boundary
//!
//! The adapter talks to hardware only through these traits. A USB backend
//! implements them on top of the vendor library; tests and the demo binary
//! use [`super::mock::MockDriver`].

use crate::error::DriverError;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// One block of raw bytes handed to the read handler
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer<'a> {
    /// Interleaved I/Q bytes, two per complex sample
    pub bytes: &'a [u8],
    /// Samples the driver lost between the previous block and this one
    pub dropped: u64,
}

/// Opens devices by index
pub trait TunerDriver: Send + Sync {
    fn device_count(&self) -> u32;

    fn device_name(&self, index: u32) -> Option<String>;

    /// Acquire exclusive access to the device at `index`
    fn open(&self, index: u32) -> DriverResult<Box<dyn TunerDevice>>;
}

/// An open tuner.
///
/// All methods take `&self`: configuration writes may arrive from the control
/// thread while another thread sits inside [`TunerDevice::read_async`].
pub trait TunerDevice: Send + Sync {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()>;

    /// Rate the hardware actually runs at after quantization
    fn sample_rate(&self) -> DriverResult<u32>;

    fn set_center_freq(&self, freq: u32) -> DriverResult<()>;

    fn center_freq(&self) -> DriverResult<u32>;

    /// `true` selects manual gain, `false` the tuner AGC
    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult<()>;

    /// Gain in tenths of a dB; the tuner picks the nearest supported step
    fn set_tuner_gain(&self, tenth_db: i32) -> DriverResult<()>;

    fn tuner_gain(&self) -> DriverResult<i32>;

    /// Supported gain steps in tenths of a dB
    fn tuner_gains(&self) -> Vec<i32>;

    fn set_tuner_bandwidth(&self, bandwidth: u32) -> DriverResult<()>;

    /// Block the calling thread, invoking `handler` once per filled buffer of
    /// `buf_len` bytes until [`TunerDevice::cancel_async`] is observed.
    ///
    /// Cancellation is seen at buffer boundaries. A cancelled read returns
    /// `Ok(())`.
    fn read_async(
        &self,
        buf_len: usize,
        handler: &mut dyn FnMut(RawBuffer<'_>),
    ) -> DriverResult<()>;

    fn cancel_async(&self) -> DriverResult<()>;

    /// Release the USB handle. Safe to call more than once.
    fn close(&self);
}
