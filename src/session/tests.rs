use super::{CallSession, ServerSession, SessionState};
use crate::config::PipelineConfig;
use crate::device::{SyntheticBackend, Waveform};
use crate::diag;
use crate::error::{DeviceError, ModelError, TransportError, WatermarkError};
use crate::watermark::reference;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn test_config(port: u16) -> PipelineConfig {
    PipelineConfig {
        frame_samples: 256,
        port,
        poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        ..PipelineConfig::default()
    }
}

fn tone_backend() -> Arc<SyntheticBackend> {
    Arc::new(SyntheticBackend::new(Waveform::Tone {
        hz: 440.0,
        amplitude: 0.5,
    }))
}

struct ModelFiles {
    _dir: TempDir,
    embedder_param: PathBuf,
    embedder_weights: PathBuf,
    detector_param: PathBuf,
    detector_weights: PathBuf,
}

fn model_files(config: &PipelineConfig) -> ModelFiles {
    let dir = tempdir().expect("tempdir");
    let paths = reference::write_reference_models(dir.path(), config).expect("write models");
    ModelFiles {
        embedder_param: paths.embedder_param,
        embedder_weights: paths.embedder_weights,
        detector_param: paths.detector_param,
        detector_weights: paths.detector_weights,
        _dir: dir,
    }
}

#[test]
fn caller_start_with_missing_model_stays_idle() {
    let _diag = diag::test_lock();
    let devices_before = diag::open_devices();
    let connections_before = diag::open_connections();
    let mut caller = CallSession::new("/no/such.param", "/no/such.bin")
        .with_config(test_config(25_911))
        .with_backend(tone_backend());
    let err = caller
        .start("127.0.0.1", 0, 0, None)
        .expect_err("must fail");
    assert!(matches!(err, WatermarkError::Model(ModelError::FileMissing(_))));
    assert_eq!(caller.state(), SessionState::Idle);
    assert_eq!(diag::open_devices(), devices_before);
    assert_eq!(diag::open_connections(), connections_before);
}

#[test]
fn callee_start_with_missing_model_stays_idle() {
    let _diag = diag::test_lock();
    let mut callee = ServerSession::new("/no/such.param", "/no/such.bin")
        .with_config(test_config(25_912))
        .with_backend(tone_backend());
    let err = callee.start(0).expect_err("must fail");
    assert!(matches!(err, WatermarkError::Model(ModelError::FileMissing(_))));
    assert_eq!(callee.state(), SessionState::Idle);
}

#[test]
fn caller_with_no_listening_callee_rolls_back() {
    let _diag = diag::test_lock();
    let devices_before = diag::open_devices();
    let connections_before = diag::open_connections();
    let config = test_config(25_913);
    let models = model_files(&config);
    let mut caller = CallSession::new(&models.embedder_param, &models.embedder_weights)
        .with_config(config)
        .with_backend(tone_backend());
    let err = caller
        .start("127.0.0.1", 0, 0, None)
        .expect_err("nothing is listening");
    assert!(matches!(
        err,
        WatermarkError::Transport(TransportError::Connect(_))
    ));
    assert_eq!(caller.state(), SessionState::Idle);
    // The devices acquired before the connect attempt were rolled back.
    assert_eq!(diag::open_devices(), devices_before);
    assert_eq!(diag::open_connections(), connections_before);
}

#[test]
fn caller_rejects_unknown_device_index() {
    let _diag = diag::test_lock();
    let config = test_config(25_914);
    let models = model_files(&config);
    let mut caller = CallSession::new(&models.embedder_param, &models.embedder_weights)
        .with_config(config)
        .with_backend(tone_backend());
    let err = caller
        .start("127.0.0.1", 0, 42, None)
        .expect_err("device 42 does not exist");
    assert!(matches!(
        err,
        WatermarkError::Device(DeviceError::NotFound(42))
    ));
    assert_eq!(caller.state(), SessionState::Idle);
}

#[test]
fn callee_stop_is_idempotent_and_releases_everything() {
    let _diag = diag::test_lock();
    let devices_before = diag::open_devices();
    let connections_before = diag::open_connections();
    let models_before = diag::live_models();

    let config = test_config(25_915);
    let models = model_files(&config);
    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config)
        .with_backend(tone_backend());
    callee.start(0).expect("start");
    assert_eq!(callee.state(), SessionState::Active);

    callee.stop().expect("first stop");
    assert_eq!(callee.state(), SessionState::Idle);
    callee.stop().expect("second stop is a no-op");
    assert_eq!(callee.state(), SessionState::Idle);
    callee.release().expect("release");
    assert_eq!(callee.state(), SessionState::Disposed);

    assert_eq!(diag::open_devices(), devices_before);
    assert_eq!(diag::open_connections(), connections_before);
    assert_eq!(diag::live_models(), models_before);
}

#[test]
fn operations_after_release_are_disposed_errors() {
    let _diag = diag::test_lock();
    let config = test_config(25_916);
    let models = model_files(&config);
    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config)
        .with_backend(tone_backend());
    callee.release().expect("release from idle");
    assert_eq!(callee.state(), SessionState::Disposed);
    assert!(matches!(callee.start(0), Err(WatermarkError::Disposed)));
    assert!(matches!(callee.stop(), Err(WatermarkError::Disposed)));
    assert!(matches!(callee.release(), Err(WatermarkError::Disposed)));
    assert!(matches!(
        callee.set_result_observer(|_, _| {}),
        Err(WatermarkError::Disposed)
    ));
}

#[test]
fn start_while_active_is_a_no_op() {
    let _diag = diag::test_lock();
    let config = test_config(25_917);
    let models = model_files(&config);
    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config)
        .with_backend(tone_backend());
    callee.start(0).expect("start");
    assert_eq!(callee.state(), SessionState::Active);
    callee.start(0).expect("second start is a no-op");
    assert_eq!(callee.state(), SessionState::Active);
    callee.stop().expect("stop");
}

#[test]
fn callee_without_caller_never_invokes_observer() {
    let _diag = diag::test_lock();
    let config = test_config(25_918);
    let models = model_files(&config);
    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config)
        .with_backend(tone_backend());
    let (tx, rx) = crossbeam_channel::bounded::<(f32, f32)>(1);
    callee
        .set_result_observer(move |instantaneous, average| {
            let _ = tx.try_send((instantaneous, average));
        })
        .expect("register observer");
    callee.start(0).expect("start");
    assert!(
        rx.recv_timeout(Duration::from_millis(500)).is_err(),
        "observer must stay silent with no caller"
    );
    callee.stop().expect("stop");
}

#[test]
fn caller_signal_file_errors_fail_fast() {
    let _diag = diag::test_lock();
    let config = test_config(25_919);
    let models = model_files(&config);
    let mut caller = CallSession::new(&models.embedder_param, &models.embedder_weights)
        .with_config(config)
        .with_backend(tone_backend());
    let err = caller
        .start(
            "127.0.0.1",
            0,
            0,
            Some(std::path::Path::new("/no/such/signal.wav")),
        )
        .expect_err("signal file is missing");
    assert!(matches!(err, WatermarkError::SignalFile(_)));
    assert_eq!(caller.state(), SessionState::Idle);
}
