use crate::error::ModelError;
use crate::frame::AudioFrame;
use crate::model::Network;
use std::time::Instant;

/// One per-frame detector output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSample {
    /// Watermark-presence probability, clamped to [0, 1].
    pub probability: f32,
    /// Sequence number of the frame this was computed from.
    pub seq: u64,
    pub at: Instant,
}

/// Scores incoming frames for watermark presence.
///
/// Stateless per frame: each score depends only on the frame it was computed
/// from, so jittered arrival needs no special handling here.
#[derive(Debug)]
pub struct WatermarkDetector {
    network: Network,
}

impl WatermarkDetector {
    /// Wrap a loaded detection network (frame in, scalar probability out).
    pub fn new(network: Network, frame_samples: usize) -> Result<Self, ModelError> {
        if network.input_width() != frame_samples {
            return Err(ModelError::InputMismatch {
                expected: frame_samples,
                actual: network.input_width(),
            });
        }
        if network.output_width() != 1 {
            return Err(ModelError::InputMismatch {
                expected: 1,
                actual: network.output_width(),
            });
        }
        Ok(Self { network })
    }

    pub fn detect(&self, frame: &AudioFrame) -> Result<DetectionSample, ModelError> {
        let out = self.network.infer(&frame.samples)?;
        let probability = out.first().copied().unwrap_or(0.0).clamp(0.0, 1.0);
        Ok(DetectionSample {
            probability,
            seq: frame.seq,
            at: Instant::now(),
        })
    }
}
