//! Full-pipeline integration tests over loopback with synthetic devices.
//!
//! Tests in this file share real TCP ports and the process-wide resource
//! counters, so they serialize on one lock.

use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use ultramark::config::PipelineConfig;
use ultramark::device::{SyntheticBackend, Waveform};
use ultramark::error::{TransportError, WatermarkError};
use ultramark::model::{self, Activation, LayerSpec, NetworkSpec};
use ultramark::session::{CallSession, ServerSession, SessionState};
use ultramark::watermark::reference;
use ultramark::{diag, signal};

static LOCK: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn test_config(port: u16) -> PipelineConfig {
    PipelineConfig {
        frame_samples: 256,
        port,
        poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(1),
        delivery_interval: Duration::from_millis(10),
        ..PipelineConfig::default()
    }
}

struct Counters {
    devices: usize,
    connections: usize,
    models: usize,
}

fn counters() -> Counters {
    Counters {
        devices: diag::open_devices(),
        connections: diag::open_connections(),
        models: diag::live_models(),
    }
}

fn assert_all_released(before: &Counters) {
    assert_eq!(diag::open_devices(), before.devices, "leaked devices");
    assert_eq!(
        diag::open_connections(),
        before.connections,
        "leaked connections"
    );
    assert_eq!(diag::live_models(), before.models, "leaked model handles");
}

fn observer_sink(
    callee: &ServerSession,
) -> Arc<Mutex<Vec<(f32, f32)>>> {
    let results: Arc<Mutex<Vec<(f32, f32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    callee
        .set_result_observer(move |instantaneous, average| {
            if let Ok(mut all) = sink.lock() {
                all.push((instantaneous, average));
            }
        })
        .expect("register observer");
    results
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn watermarked_tone_is_detected_over_loopback() {
    let _guard = serialize();
    let before = counters();
    let config = test_config(25_931);
    let dir = tempdir().expect("tempdir");
    let models = reference::write_reference_models(dir.path(), &config).expect("write models");

    let callee_backend = Arc::new(SyntheticBackend::new(Waveform::Silence));
    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config.clone())
        .with_backend(callee_backend.clone());
    let results = observer_sink(&callee);
    callee.start(0).expect("callee start");

    let mut caller = CallSession::new(&models.embedder_param, &models.embedder_weights)
        .with_config(config)
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Tone {
            hz: 440.0,
            amplitude: 0.5,
        })));
    caller.start("127.0.0.1", 0, 0, None).expect("caller start");

    // Give the pipeline time to move a few hundred frames end to end.
    let converged = wait_until(Duration::from_secs(5), || {
        results
            .lock()
            .map(|all| all.last().map(|(_, avg)| *avg > 0.8).unwrap_or(false))
            .unwrap_or(false)
    });

    caller.stop().expect("caller stop");
    caller.release().expect("caller release");
    callee.stop().expect("callee stop");
    callee.release().expect("callee release");

    let all = results.lock().expect("results");
    assert!(!all.is_empty(), "observer never fired");
    assert!(converged, "average never converged above 0.8: {:?}", all.last());
    let (first_instantaneous, _) = all[0];
    assert!(
        first_instantaneous > 0.5,
        "first delivered instantaneous was {first_instantaneous}"
    );
    for (instantaneous, average) in all.iter() {
        assert!((0.0..=1.0).contains(instantaneous));
        assert!((0.0..=1.0).contains(average));
    }
    assert!(callee_backend.frames_played() > 0, "callee never played audio");
    drop(all);
    assert_all_released(&before);
}

#[test]
fn unwatermarked_stream_scores_low() {
    let _guard = serialize();
    let before = counters();
    let config = test_config(25_932);
    let dir = tempdir().expect("tempdir");
    let models = reference::write_reference_models(dir.path(), &config).expect("write models");

    // A pass-through "embedder": identity weights, zero bias, no watermark.
    let n = config.frame_samples;
    let spec = NetworkSpec {
        name: Some("passthrough".to_string()),
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
    let passthrough_param = dir.path().join("passthrough.param");
    let passthrough_weights = dir.path().join("passthrough.bin");
    model::write_network(&passthrough_param, &passthrough_weights, &spec, &weights)
        .expect("write passthrough");

    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config.clone())
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Silence)));
    let results = observer_sink(&callee);
    callee.start(0).expect("callee start");

    let mut caller = CallSession::new(&passthrough_param, &passthrough_weights)
        .with_config(config)
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Tone {
            hz: 440.0,
            amplitude: 0.5,
        })));
    caller.start("127.0.0.1", 0, 0, None).expect("caller start");

    wait_until(Duration::from_secs(3), || {
        results.lock().map(|all| all.len() >= 10).unwrap_or(false)
    });

    caller.stop().expect("caller stop");
    caller.release().expect("caller release");
    callee.stop().expect("callee stop");
    callee.release().expect("callee release");

    let all = results.lock().expect("results");
    assert!(!all.is_empty(), "observer never fired");
    let (_, last_average) = *all.last().expect("last");
    assert!(
        last_average < 0.5,
        "unwatermarked stream averaged {last_average}"
    );
    drop(all);
    assert_all_released(&before);
}

#[test]
fn corrupt_stream_fails_the_callee_and_stop_still_cleans_up() {
    let _guard = serialize();
    let before = counters();
    let config = test_config(25_933);
    let dir = tempdir().expect("tempdir");
    let models = reference::write_reference_models(dir.path(), &config).expect("write models");

    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config)
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Silence)));
    let results = observer_sink(&callee);
    callee.start(0).expect("callee start");

    // A rogue peer sends garbage instead of framed audio. One full header's
    // worth of bytes guarantees the receiver sees the bad magic.
    let mut stream = TcpStream::connect(("127.0.0.1", 25_933)).expect("connect");
    stream.write_all(&[0xBAu8; 16]).expect("write garbage");

    assert!(
        wait_until(Duration::from_secs(3), || callee.state()
            == SessionState::Failed),
        "callee never failed"
    );
    match callee.last_error() {
        Some(WatermarkError::Transport(TransportError::Corrupt(_))) => {}
        other => panic!("expected a corrupt-stream error, got {other:?}"),
    }
    assert!(
        results.lock().expect("results").is_empty(),
        "garbage must not produce detection results"
    );

    callee.stop().expect("stop after failure");
    assert_eq!(callee.state(), SessionState::Idle);
    callee.release().expect("release");
    drop(stream);
    assert_all_released(&before);
}

#[test]
fn non_looping_signal_file_ends_transmission_cleanly() {
    let _guard = serialize();
    let before = counters();
    let mut config = test_config(25_934);
    config.loop_signal = false;
    let dir = tempdir().expect("tempdir");
    let models = reference::write_reference_models(dir.path(), &config).expect("write models");

    let signal_path = dir.path().join("probe.wav");
    signal::write_multitone_wav(
        &signal_path,
        config.sample_rate,
        Duration::from_millis(300),
        signal::PROBE_AMPLITUDE,
    )
    .expect("write signal");

    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(config.clone())
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Silence)));
    let results = observer_sink(&callee);
    callee.start(0).expect("callee start");

    let mut caller = CallSession::new(&models.embedder_param, &models.embedder_weights)
        .with_config(config)
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Silence)));
    caller
        .start("127.0.0.1", 0, 0, Some(Path::new(&signal_path)))
        .expect("caller start");

    // The 300 ms file drains, the caller disconnects cleanly, and the
    // callee goes back to waiting for the next connection.
    assert!(
        wait_until(Duration::from_secs(3), || !results
            .lock()
            .map(|all| all.is_empty())
            .unwrap_or(true)),
        "no frames reached the detector"
    );
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(caller.state(), SessionState::Active);
    assert_eq!(callee.state(), SessionState::Active);

    caller.stop().expect("caller stop");
    caller.release().expect("caller release");
    callee.stop().expect("callee stop");
    callee.release().expect("callee release");
    assert_all_released(&before);
}
