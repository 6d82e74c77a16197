//! Live resource counters.
//!
//! Devices, transport connections, and loaded networks bump a counter at
//! construction and release it on drop, so teardown correctness is
//! observable: after `stop()` + `release()` every counter must read zero.

use std::sync::atomic::{AtomicUsize, Ordering};

static OPEN_DEVICES: AtomicUsize = AtomicUsize::new(0);
static OPEN_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static LIVE_MODELS: AtomicUsize = AtomicUsize::new(0);

/// Number of capture/playback devices currently open, process-wide.
pub fn open_devices() -> usize {
    OPEN_DEVICES.load(Ordering::SeqCst)
}

/// Number of transport connections (and listeners) currently open.
pub fn open_connections() -> usize {
    OPEN_CONNECTIONS.load(Ordering::SeqCst)
}

/// Number of loaded inference networks currently alive.
pub fn live_models() -> usize {
    LIVE_MODELS.load(Ordering::SeqCst)
}

pub(crate) fn device_opened() {
    OPEN_DEVICES.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn device_closed() {
    OPEN_DEVICES.fetch_sub(1, Ordering::SeqCst);
}

pub(crate) fn connection_opened() {
    OPEN_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn connection_closed() {
    OPEN_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
}

pub(crate) fn model_loaded() {
    LIVE_MODELS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn model_dropped() {
    LIVE_MODELS.fetch_sub(1, Ordering::SeqCst);
}

/// Serializes tests that create counted resources so exact counter
/// assertions do not race across test threads.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
