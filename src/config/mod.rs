//! Pipeline configuration and validation.

use crate::error::WatermarkError;
use std::time::Duration;

/// Default capture/playback/wire sample rate. 48 kHz leaves headroom for the
/// 16.0-17.5 kHz probing band.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default frame length in samples (about 10.7 ms at 48 kHz).
pub const DEFAULT_FRAME_SAMPLES: usize = 512;

/// Default capacity of the bounded inter-stage queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default TCP port of the callee server. A configured port of 0 selects it.
pub const DEFAULT_PORT: u16 = 24_600;

/// Default rolling-average horizon for the result aggregator.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Default minimum interval between observer callback deliveries.
pub const DEFAULT_DELIVERY_INTERVAL: Duration = Duration::from_millis(50);

/// How long blocked stage loops wait before re-checking their stop flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default TCP connect timeout on the caller.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Tunables shared by both session roles. Validated once at `start()`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    /// Bounded queue depth between pipeline stages. When a queue is full the
    /// oldest frame is dropped, never the producer blocked.
    pub queue_capacity: usize,
    /// Callee listen port / caller connect port. 0 selects `DEFAULT_PORT`.
    pub port: u16,
    pub connect_timeout: Duration,
    /// Upper bound on how long any blocked read/write waits before checking
    /// for cancellation; also bounds `stop()` latency.
    pub poll_interval: Duration,
    /// Rolling-average horizon of the result aggregator.
    pub window: Duration,
    /// Minimum spacing between observer callback invocations.
    pub delivery_interval: Duration,
    /// Whether a configured signal file loops at EOF (true) or ends the
    /// transmission (false).
    pub loop_signal: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            port: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            window: DEFAULT_WINDOW,
            delivery_interval: DEFAULT_DELIVERY_INTERVAL,
            loop_signal: true,
        }
    }
}

impl PipelineConfig {
    /// Check ranges before any resource is acquired.
    pub fn validate(&self) -> Result<(), WatermarkError> {
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(WatermarkError::Config(format!(
                "sample_rate must be between 8000 and 192000 Hz, got {}",
                self.sample_rate
            )));
        }
        if !(64..=1 << 16).contains(&self.frame_samples) {
            return Err(WatermarkError::Config(format!(
                "frame_samples must be between 64 and 65536, got {}",
                self.frame_samples
            )));
        }
        if !(2..=1024).contains(&self.queue_capacity) {
            return Err(WatermarkError::Config(format!(
                "queue_capacity must be between 2 and 1024, got {}",
                self.queue_capacity
            )));
        }
        if self.poll_interval.is_zero() || self.poll_interval > Duration::from_secs(5) {
            return Err(WatermarkError::Config(
                "poll_interval must be nonzero and at most 5s".to_string(),
            ));
        }
        if self.window.is_zero() || self.window > Duration::from_secs(600) {
            return Err(WatermarkError::Config(
                "window must be nonzero and at most 600s".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the port sentinel: 0 means the default port.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// Wall-clock duration of one frame at the configured rate.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_samples as f64 / self.sample_rate as f64)
    }
}
