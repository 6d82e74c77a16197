//! Reference watermark model pair.
//!
//! Builds a functional embedder/detector pair for a given pipeline
//! configuration: the embedder is an identity layer whose bias adds the
//! ultrasonic probe carrier, the detector is a matched filter against that
//! carrier followed by a sigmoid. Used by the loopback self-test and as the
//! artifact set for environments that ship no trained models.

use crate::config::PipelineConfig;
use crate::error::ModelError;
use crate::model::{self, Activation, LayerSpec, NetworkSpec};
use crate::signal;
use std::path::{Path, PathBuf};

/// Peak amplitude of the embedded carrier. Small enough to stay inaudible
/// under typical program material, large enough for a solid matched-filter
/// margin over one frame.
pub const CARRIER_AMPLITUDE: f32 = 0.08;

/// Sigmoid steepness of the reference detector.
const DETECTOR_GAIN: f32 = 24.0;

/// File names of a written model pair.
#[derive(Debug, Clone)]
pub struct ReferenceModelPaths {
    pub embedder_param: PathBuf,
    pub embedder_weights: PathBuf,
    pub detector_param: PathBuf,
    pub detector_weights: PathBuf,
}

fn carrier(config: &PipelineConfig) -> Vec<f32> {
    let mut carrier = vec![0.0f32; config.frame_samples];
    signal::fill_multitone(config.sample_rate, CARRIER_AMPLITUDE, 0, &mut carrier);
    carrier
}

/// Embedding network: identity weights, carrier bias.
pub fn embedder_network(config: &PipelineConfig) -> (NetworkSpec, Vec<f32>) {
    let n = config.frame_samples;
    let spec = NetworkSpec {
        name: Some("reference-embedder".to_string()),
        input: n,
        layers: vec![LayerSpec {
            output: n,
            activation: Activation::Linear,
        }],
    };
    let mut weights = vec![0.0f32; n * n + n];
    for i in 0..n {
        weights[i * n + i] = 1.0;
    }
    weights[n * n..].copy_from_slice(&carrier(config));
    (spec, weights)
}

/// Detection network: matched filter against the carrier, sigmoid output.
///
/// The decision threshold sits at half the carrier's own correlation, so a
/// watermarked frame lands far above 0.5 and clean material far below.
pub fn detector_network(config: &PipelineConfig) -> (NetworkSpec, Vec<f32>) {
    let n = config.frame_samples;
    let carrier = carrier(config);
    let norm = carrier.iter().map(|s| s * s).sum::<f32>().sqrt().max(1e-9);
    let threshold = norm / 2.0;

    let spec = NetworkSpec {
        name: Some("reference-detector".to_string()),
        input: n,
        layers: vec![LayerSpec {
            output: 1,
            activation: Activation::Sigmoid,
        }],
    };
    let mut weights = Vec::with_capacity(n + 1);
    for sample in &carrier {
        weights.push(sample / norm * DETECTOR_GAIN);
    }
    weights.push(-DETECTOR_GAIN * threshold);
    (spec, weights)
}

/// Write both model pairs into `dir` and return the paths.
pub fn write_reference_models(
    dir: &Path,
    config: &PipelineConfig,
) -> Result<ReferenceModelPaths, ModelError> {
    let paths = ReferenceModelPaths {
        embedder_param: dir.join("embedder.param"),
        embedder_weights: dir.join("embedder.bin"),
        detector_param: dir.join("detector.param"),
        detector_weights: dir.join("detector.bin"),
    };
    let (embed_spec, embed_weights) = embedder_network(config);
    model::write_network(
        &paths.embedder_param,
        &paths.embedder_weights,
        &embed_spec,
        &embed_weights,
    )?;
    let (detect_spec, detect_weights) = detector_network(config);
    model::write_network(
        &paths.detector_param,
        &paths.detector_weights,
        &detect_spec,
        &detect_weights,
    )?;
    Ok(paths)
}
