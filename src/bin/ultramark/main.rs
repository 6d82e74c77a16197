//! Ultramark entrypoint: run the caller role, the callee role, or a
//! loopback self-test that wires both over 127.0.0.1 with synthetic
//! devices and generated reference models.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use ultramark::config::PipelineConfig;
use ultramark::device::{AudioBackend, CpalBackend, SyntheticBackend, Waveform};
use ultramark::session::{CallSession, ServerSession, SessionState};
use ultramark::telemetry;
use ultramark::watermark::reference;

/// How often the callee prints the current probabilities.
const REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Capture, embed, and transmit.
    Caller,
    /// Receive, detect, and report.
    Callee,
    /// Run both roles over loopback with synthetic devices.
    Loopback,
}

/// CLI options for the ultramark pipeline.
#[derive(Debug, Parser)]
#[command(about = "Ultrasonic watermark call pipeline", version)]
struct AppConfig {
    #[arg(long, value_enum, default_value = "loopback")]
    role: Role,

    /// Callee host to connect to (caller role)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TCP port; 0 selects the default port
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Model parameter descriptor path
    #[arg(long = "param-path")]
    param_path: Option<PathBuf>,

    /// Model weight blob path
    #[arg(long = "weight-path")]
    weight_path: Option<PathBuf>,

    /// WAV signal file transmitted in place of live capture (caller role)
    #[arg(long)]
    signal: Option<PathBuf>,

    /// Playback device index; 0 is the platform default
    #[arg(long = "play-device", default_value_t = 0)]
    play_device: usize,

    /// Capture device index; 0 is the platform default
    #[arg(long = "record-device", default_value_t = 0)]
    record_device: usize,

    /// Print detected audio devices and exit
    #[arg(long = "list-devices", default_value_t = false)]
    list_devices: bool,

    /// Use synthetic devices instead of audio hardware
    #[arg(long, default_value_t = false)]
    synthetic: bool,

    /// How long to run before stopping; 0 runs until killed
    #[arg(long = "duration-secs", default_value_t = 10)]
    duration_secs: u64,

    /// Write JSONL trace logs instead of stderr output
    #[arg(long, env = "ULTRAMARK_LOGS", default_value_t = false)]
    logs: bool,
}

impl AppConfig {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            port: self.port,
            ..PipelineConfig::default()
        }
    }

    fn backend(&self) -> Arc<dyn AudioBackend> {
        if self.synthetic {
            Arc::new(SyntheticBackend::new(Waveform::Tone {
                hz: 440.0,
                amplitude: 0.5,
            }))
        } else {
            Arc::new(CpalBackend::new())
        }
    }

    fn model_paths(&self) -> Result<(PathBuf, PathBuf)> {
        match (&self.param_path, &self.weight_path) {
            (Some(param), Some(weights)) => Ok((param.clone(), weights.clone())),
            _ => bail!("--param-path and --weight-path are required for this role"),
        }
    }
}

fn main() -> Result<()> {
    let config = AppConfig::parse();
    telemetry::init_tracing(config.logs);

    if config.list_devices {
        return list_devices();
    }

    match config.role {
        Role::Caller => run_caller(&config),
        Role::Callee => run_callee(&config),
        Role::Loopback => run_loopback(&config),
    }
}

fn list_devices() -> Result<()> {
    let backend = CpalBackend::new();
    let capture = backend
        .capture_device_names()
        .context("failed to list capture devices")?;
    let playback = backend
        .playback_device_names()
        .context("failed to list playback devices")?;
    println!("capture devices (index 0 = default):");
    for (i, name) in capture.iter().enumerate() {
        println!("  {}: {name}", i + 1);
    }
    println!("playback devices (index 0 = default):");
    for (i, name) in playback.iter().enumerate() {
        println!("  {}: {name}", i + 1);
    }
    Ok(())
}

fn run_caller(config: &AppConfig) -> Result<()> {
    let (param, weights) = config.model_paths()?;
    let mut caller = CallSession::new(param, weights)
        .with_config(config.pipeline_config())
        .with_backend(config.backend());
    caller
        .start(
            &config.host,
            config.play_device,
            config.record_device,
            config.signal.as_deref(),
        )
        .context("caller failed to start")?;
    println!("caller active, streaming to {}", config.host);

    wait_while_active(config.duration_secs, || caller.state());
    if caller.state() == SessionState::Failed {
        if let Some(err) = caller.last_error() {
            eprintln!("caller failed: {err}");
        }
    }
    caller.stop().context("caller stop")?;
    caller.release().context("caller release")?;
    Ok(())
}

fn run_callee(config: &AppConfig) -> Result<()> {
    let (param, weights) = config.model_paths()?;
    let mut callee = ServerSession::new(param, weights)
        .with_config(config.pipeline_config())
        .with_backend(config.backend());
    let latest: Arc<Mutex<Option<(f32, f32)>>> = Arc::new(Mutex::new(None));
    let observer_latest = latest.clone();
    callee
        .set_result_observer(move |instantaneous, average| {
            if let Ok(mut slot) = observer_latest.lock() {
                *slot = Some((instantaneous, average));
            }
        })
        .context("register observer")?;
    callee.start(config.play_device).context("callee failed to start")?;
    println!("callee listening");

    let started = Instant::now();
    let mut last_report = Instant::now();
    loop {
        if config.duration_secs > 0 && started.elapsed() >= Duration::from_secs(config.duration_secs)
        {
            break;
        }
        if callee.state() == SessionState::Failed {
            if let Some(err) = callee.last_error() {
                eprintln!("callee failed: {err}");
            }
            break;
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            if let Ok(slot) = latest.lock() {
                if let Some((instantaneous, average)) = *slot {
                    println!(
                        "watermark probability: instantaneous {instantaneous:.3} average {average:.3}"
                    );
                }
            }
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    callee.stop().context("callee stop")?;
    callee.release().context("callee release")?;
    Ok(())
}

/// Full pipeline on one machine: generated reference models, synthetic
/// devices, loopback transport. Exits nonzero if detection never converges.
fn run_loopback(config: &AppConfig) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("ultramark-selftest-{}", std::process::id()));
    std::fs::create_dir_all(&dir).context("create model dir")?;
    let pipeline = config.pipeline_config();
    let models =
        reference::write_reference_models(&dir, &pipeline).context("write reference models")?;
    println!("reference models written to {}", dir.display());

    let mut callee = ServerSession::new(&models.detector_param, &models.detector_weights)
        .with_config(pipeline.clone())
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Silence)));
    let results: Arc<Mutex<Vec<(f32, f32)>>> = Arc::new(Mutex::new(Vec::new()));
    let observer_results = results.clone();
    callee
        .set_result_observer(move |instantaneous, average| {
            if let Ok(mut all) = observer_results.lock() {
                all.push((instantaneous, average));
            }
        })
        .context("register observer")?;
    callee.start(0).context("callee failed to start")?;

    let mut caller = CallSession::new(&models.embedder_param, &models.embedder_weights)
        .with_config(pipeline)
        .with_backend(Arc::new(SyntheticBackend::new(Waveform::Tone {
            hz: 440.0,
            amplitude: 0.5,
        })));
    caller
        .start("127.0.0.1", 0, 0, None)
        .context("caller failed to start")?;
    println!("loopback call running");

    let run_for = Duration::from_secs(config.duration_secs.max(2));
    let started = Instant::now();
    while started.elapsed() < run_for {
        if caller.state() == SessionState::Failed || callee.state() == SessionState::Failed {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    caller.stop().context("caller stop")?;
    caller.release().context("caller release")?;
    callee.stop().context("callee stop")?;
    callee.release().context("callee release")?;
    let _ = std::fs::remove_dir_all(&dir);

    let results = results.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let Some((instantaneous, average)) = results.last().copied() else {
        bail!("self-test produced no detection results");
    };
    println!(
        "self-test: {} result(s), last instantaneous {instantaneous:.3}, last average {average:.3}",
        results.len()
    );
    if average < 0.5 {
        bail!("self-test failed: average probability {average:.3} below 0.5");
    }
    println!("self-test passed");
    Ok(())
}

fn wait_while_active(duration_secs: u64, state: impl Fn() -> SessionState) {
    let started = Instant::now();
    loop {
        if duration_secs > 0 && started.elapsed() >= Duration::from_secs(duration_secs) {
            break;
        }
        if state() == SessionState::Failed {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
