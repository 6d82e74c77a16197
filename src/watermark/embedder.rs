use crate::error::ModelError;
use crate::frame::AudioFrame;
use crate::model::Network;

/// Embeds the ultrasonic watermark into PCM frames.
///
/// The watermark itself lives in the embedding network's parameters; this
/// stage only enforces the frame contract: output length, rate, and sequence
/// number equal the input's, samples clamped to [-1, 1].
#[derive(Debug)]
pub struct WatermarkEmbedder {
    network: Network,
}

impl WatermarkEmbedder {
    /// Wrap a loaded embedding network, checking it preserves frame size.
    pub fn new(network: Network, frame_samples: usize) -> Result<Self, ModelError> {
        if network.input_width() != frame_samples {
            return Err(ModelError::InputMismatch {
                expected: frame_samples,
                actual: network.input_width(),
            });
        }
        if network.output_width() != frame_samples {
            return Err(ModelError::InputMismatch {
                expected: frame_samples,
                actual: network.output_width(),
            });
        }
        Ok(Self { network })
    }

    pub fn embed(&self, frame: &AudioFrame) -> Result<AudioFrame, ModelError> {
        let out = self.network.infer(&frame.samples)?;
        let samples = out.into_iter().map(|s| s.clamp(-1.0, 1.0)).collect();
        Ok(AudioFrame {
            seq: frame.seq,
            sample_rate: frame.sample_rate,
            samples,
            captured_at: frame.captured_at,
        })
    }
}
