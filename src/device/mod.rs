//! Audio device abstraction: frame-synchronous capture and playback.
//!
//! A backend opens capture/playback endpoints by device index (0 selects the
//! platform default). `read_frame`/`write_frame` block until a frame boundary
//! or until the device is cancelled from another thread, in which case they
//! return `DeviceError::Cancelled` instead of blocking forever. Devices are
//! single-owner: exactly one thread reads or writes a given device.

mod cpal_backend;
mod synthetic;

pub use cpal_backend::CpalBackend;
pub use synthetic::{SyntheticBackend, Waveform};

use crate::diag;
use crate::error::DeviceError;
use crate::frame::AudioFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Device index sentinel that selects the platform default device.
pub const DEFAULT_DEVICE: usize = 0;

/// Cooperative cancellation handle for a blocked device operation.
///
/// Cloned out of a device before it moves to its worker thread; `cancel()`
/// makes the next (or current) blocking call return `DeviceError::Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// RAII bump of the open-device counter.
#[derive(Debug)]
pub(crate) struct DeviceGuard(());

impl DeviceGuard {
    pub(crate) fn acquire() -> Self {
        diag::device_opened();
        Self(())
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        diag::device_closed();
    }
}

/// A capture endpoint producing fixed-size frames in sequence order.
pub trait CaptureDevice: Send {
    /// Block until the next frame boundary. `Ok(None)` signals a clean end
    /// of stream (only file-backed sources ever reach it).
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError>;

    /// Handle that unblocks `read_frame` from another thread.
    fn cancel_token(&self) -> CancelToken;

    /// Release the underlying endpoint. Further reads fail with `Cancelled`.
    fn close(&mut self);
}

/// A playback endpoint consuming fixed-size frames.
pub trait PlaybackDevice: Send {
    /// Block until the frame has been handed to the output path.
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), DeviceError>;

    fn cancel_token(&self) -> CancelToken;

    fn close(&mut self);
}

/// Factory for capture/playback endpoints, keyed by device index.
pub trait AudioBackend: Send + Sync {
    fn open_capture(
        &self,
        device_index: usize,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError>;

    fn open_playback(
        &self,
        device_index: usize,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError>;

    /// Human-readable capture device names, in index order (index 1 is the
    /// first entry; 0 is the default device).
    fn capture_device_names(&self) -> Result<Vec<String>, DeviceError>;

    fn playback_device_names(&self) -> Result<Vec<String>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn device_guard_tracks_open_count() {
        let _diag = diag::test_lock();
        let before = diag::open_devices();
        let guard = DeviceGuard::acquire();
        assert_eq!(diag::open_devices(), before + 1);
        drop(guard);
        assert_eq!(diag::open_devices(), before);
    }
}
