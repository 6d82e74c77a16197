//! Frame-granular PCM audio.
//!
//! An `AudioFrame` is the unit of work for every pipeline stage: a fixed-size
//! block of mono f32 samples plus the bookkeeping the stages need (sequence
//! number, rate, capture instant). Frames are immutable once produced and
//! move between stages by ownership transfer.

use std::time::{Duration, Instant};

const METER_FLOOR_DB: f32 = -60.0;

/// One fixed-size block of mono PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonic sequence number, starting at 0 for each session.
    pub seq: u64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
    /// Monotonic instant the first sample of this frame was captured
    /// (or received, for frames reconstructed from the network).
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(seq: u64, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            seq,
            sample_rate,
            samples,
            captured_at: Instant::now(),
        }
    }

    /// Wall-clock span this frame covers at its sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// RMS level in dBFS, floored at -60 dB for silence/empty frames.
    pub fn rms_db(&self) -> f32 {
        if self.samples.is_empty() {
            return METER_FLOOR_DB;
        }
        let energy: f32 =
            self.samples.iter().map(|s| s * s).sum::<f32>() / self.samples.len() as f32;
        let rms = energy.sqrt().max(1e-6);
        (20.0 * rms.log10()).max(METER_FLOOR_DB)
    }
}
