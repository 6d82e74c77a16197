use super::reference;
use super::{WatermarkDetector, WatermarkEmbedder};
use crate::config::PipelineConfig;
use crate::error::ModelError;
use crate::frame::AudioFrame;
use crate::model::Network;
use crate::signal;
use tempfile::tempdir;

fn test_config() -> PipelineConfig {
    PipelineConfig {
        frame_samples: 256,
        ..PipelineConfig::default()
    }
}

fn load_pair(config: &PipelineConfig) -> (WatermarkEmbedder, WatermarkDetector) {
    let dir = tempdir().expect("tempdir");
    let paths = reference::write_reference_models(dir.path(), config).expect("write models");
    let embedder = WatermarkEmbedder::new(
        Network::load(&paths.embedder_param, &paths.embedder_weights).expect("load embedder"),
        config.frame_samples,
    )
    .expect("embedder");
    let detector = WatermarkDetector::new(
        Network::load(&paths.detector_param, &paths.detector_weights).expect("load detector"),
        config.frame_samples,
    )
    .expect("detector");
    (embedder, detector)
}

fn tone_frame(config: &PipelineConfig, seq: u64) -> AudioFrame {
    let mut samples = vec![0.0f32; config.frame_samples];
    signal::fill_tone(
        config.sample_rate,
        440.0,
        0.5,
        seq * config.frame_samples as u64,
        &mut samples,
    );
    AudioFrame::new(seq, config.sample_rate, samples)
}

#[test]
fn embedding_preserves_frame_shape() {
    let _diag = crate::diag::test_lock();
    let config = test_config();
    let (embedder, _) = load_pair(&config);
    let input = tone_frame(&config, 3);
    let output = embedder.embed(&input).expect("embed");
    assert_eq!(output.samples.len(), input.samples.len());
    assert_eq!(output.seq, input.seq);
    assert_eq!(output.sample_rate, input.sample_rate);
    assert!(output.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
    // The watermarked frame differs from the input.
    assert_ne!(output.samples, input.samples);
}

#[test]
fn watermarked_frames_score_high_clean_frames_low() {
    let _diag = crate::diag::test_lock();
    let config = test_config();
    let (embedder, detector) = load_pair(&config);
    for seq in 0..4 {
        let clean = tone_frame(&config, seq);
        let marked = embedder.embed(&clean).expect("embed");
        let hot = detector.detect(&marked).expect("detect");
        let cold = detector.detect(&clean).expect("detect");
        assert!(
            hot.probability > 0.9,
            "watermarked frame {seq} scored {}",
            hot.probability
        );
        assert!(
            cold.probability < 0.5,
            "clean frame {seq} scored {}",
            cold.probability
        );
        assert_eq!(hot.seq, seq);
    }
}

#[test]
fn silence_scores_low() {
    let _diag = crate::diag::test_lock();
    let config = test_config();
    let (_, detector) = load_pair(&config);
    let silence = AudioFrame::new(0, config.sample_rate, vec![0.0; config.frame_samples]);
    let sample = detector.detect(&silence).expect("detect");
    assert!(sample.probability < 0.5);
}

#[test]
fn embedder_rejects_frame_size_mismatch() {
    let _diag = crate::diag::test_lock();
    let config = test_config();
    let dir = tempdir().expect("tempdir");
    let paths = reference::write_reference_models(dir.path(), &config).expect("write models");
    let network =
        Network::load(&paths.embedder_param, &paths.embedder_weights).expect("load embedder");
    let err = WatermarkEmbedder::new(network, 512).expect_err("size mismatch");
    assert!(matches!(err, ModelError::InputMismatch { .. }));
}

#[test]
fn detector_requires_scalar_output() {
    let _diag = crate::diag::test_lock();
    let config = test_config();
    let dir = tempdir().expect("tempdir");
    let paths = reference::write_reference_models(dir.path(), &config).expect("write models");
    // The embedder network is frame-in/frame-out; the detector must refuse it.
    let network =
        Network::load(&paths.embedder_param, &paths.embedder_weights).expect("load embedder");
    let err = WatermarkDetector::new(network, config.frame_samples).expect_err("not scalar");
    assert!(matches!(err, ModelError::InputMismatch { .. }));
}
