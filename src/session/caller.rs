//! Caller session: capture, embed, sidetone, transmit.

use super::{SessionState, StateCell};
use crate::config::PipelineConfig;
use crate::device::{AudioBackend, CancelToken, CaptureDevice, CpalBackend, PlaybackDevice};
use crate::error::{DeviceError, WatermarkError};
use crate::frame::AudioFrame;
use crate::model::Network;
use crate::signal::SignalFileSource;
use crate::transport::{FrameSender, LinkShutdown};
use crate::watermark::WatermarkEmbedder;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Caller-side session: captures (or file-sources) audio, embeds the
/// watermark, monitors it locally, and streams it to the callee.
pub struct CallSession {
    param_path: PathBuf,
    weight_path: PathBuf,
    config: PipelineConfig,
    backend: Arc<dyn AudioBackend>,
    state: Arc<StateCell>,
    runtime: Option<CallerRuntime>,
}

struct CallerRuntime {
    threads: Vec<JoinHandle<()>>,
    cancels: Vec<CancelToken>,
    link_shutdown: LinkShutdown,
    shutdown: Arc<AtomicBool>,
}

impl CallSession {
    /// Create a caller around an embedding model pair. The model is loaded
    /// during `start()`, not here.
    pub fn new(param_path: impl Into<PathBuf>, weight_path: impl Into<PathBuf>) -> Self {
        Self {
            param_path: param_path.into(),
            weight_path: weight_path.into(),
            config: PipelineConfig::default(),
            backend: Arc::new(CpalBackend::new()),
            state: StateCell::new(),
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the audio backend (tests and self-test use the synthetic one).
    pub fn with_backend(mut self, backend: Arc<dyn AudioBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn last_error(&self) -> Option<WatermarkError> {
        self.state.last_error()
    }

    /// Acquire devices, load the model, connect, and go `Active`.
    ///
    /// Device index 0 selects the platform default. With `signal` set, the
    /// WAV file replaces live capture. A failure rolls back every partially
    /// acquired resource and leaves the session `Idle`. Calling `start()` on
    /// an already running session is a no-op.
    pub fn start(
        &mut self,
        host: &str,
        play_device: usize,
        record_device: usize,
        signal: Option<&Path>,
    ) -> Result<(), WatermarkError> {
        match self.state.get() {
            SessionState::Disposed => return Err(WatermarkError::Disposed),
            SessionState::Starting | SessionState::Active | SessionState::Stopping => {
                return Ok(())
            }
            SessionState::Failed => self.teardown(),
            SessionState::Idle => {}
        }
        self.config.validate()?;
        self.state.clear_error();
        self.state.set(SessionState::Starting);
        match self.start_inner(host, play_device, record_device, signal) {
            Ok(runtime) => {
                self.runtime = Some(runtime);
                self.state.set(SessionState::Active);
                tracing::info!("caller session active");
                Ok(())
            }
            Err(err) => {
                self.state.store_error(err.clone());
                self.state.set(SessionState::Idle);
                Err(err)
            }
        }
    }

    fn start_inner(
        &mut self,
        host: &str,
        play_device: usize,
        record_device: usize,
        signal: Option<&Path>,
    ) -> Result<CallerRuntime, WatermarkError> {
        let config = &self.config;

        let network = Network::load(&self.param_path, &self.weight_path)?;
        let embedder = WatermarkEmbedder::new(network, config.frame_samples)?;

        let source: Box<dyn CaptureDevice> = match signal {
            Some(path) => Box::new(SignalFileSource::open(
                path,
                config.sample_rate,
                config.frame_samples,
                config.loop_signal,
            )?),
            None => self.backend.open_capture(
                record_device,
                config.sample_rate,
                config.frame_samples,
            )?,
        };
        let sidetone =
            self.backend
                .open_playback(play_device, config.sample_rate, config.frame_samples)?;

        let sender = FrameSender::connect(host, config.effective_port(), config.connect_timeout)?;
        let link_shutdown = sender.shutdown_handle()?;

        let (frame_tx, frame_rx) = bounded::<AudioFrame>(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let cancels = vec![source.cancel_token(), sidetone.cancel_token()];

        let capture_thread = {
            let shutdown = shutdown.clone();
            let state = self.state.clone();
            let drop_rx = frame_rx.clone();
            thread::spawn(move || capture_loop(source, frame_tx, drop_rx, shutdown, state))
        };
        let embed_thread = {
            let shutdown = shutdown.clone();
            let state = self.state.clone();
            let poll = config.poll_interval;
            thread::spawn(move || {
                embed_send_loop(embedder, sidetone, sender, frame_rx, poll, shutdown, state)
            })
        };

        Ok(CallerRuntime {
            threads: vec![capture_thread, embed_thread],
            cancels,
            link_shutdown,
            shutdown,
        })
    }

    /// Idempotent stop: cancel every blocked stage, join the threads, and
    /// release resources before returning. `stop()` from `Idle` is a no-op.
    pub fn stop(&mut self) -> Result<(), WatermarkError> {
        match self.state.get() {
            SessionState::Disposed => return Err(WatermarkError::Disposed),
            SessionState::Idle => return Ok(()),
            _ => {}
        }
        self.state.set(SessionState::Stopping);
        self.teardown();
        self.state.set(SessionState::Idle);
        tracing::info!("caller session stopped");
        Ok(())
    }

    /// Dispose the session. Any later operation fails with `DisposedError`.
    pub fn release(&mut self) -> Result<(), WatermarkError> {
        if self.state.get() == SessionState::Disposed {
            return Err(WatermarkError::Disposed);
        }
        self.stop()?;
        self.state.set(SessionState::Disposed);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown.store(true, Ordering::SeqCst);
            for cancel in &runtime.cancels {
                cancel.cancel();
            }
            runtime.link_shutdown.shutdown();
            for handle in runtime.threads {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.state.get() != SessionState::Disposed {
            let _ = self.stop();
        }
    }
}

/// Capture stage: pull frames from the source into the bounded embed queue,
/// dropping the oldest queued frame under backpressure so capture never
/// stalls. Dropped frames surface at the callee as sequence gaps.
fn capture_loop(
    mut source: Box<dyn CaptureDevice>,
    frame_tx: Sender<AudioFrame>,
    drop_rx: Receiver<AudioFrame>,
    shutdown: Arc<AtomicBool>,
    state: Arc<StateCell>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match source.read_frame() {
            Ok(Some(frame)) => {
                if let Err(TrySendError::Full(frame)) = frame_tx.try_send(frame) {
                    let _ = drop_rx.try_recv();
                    tracing::debug!("embed queue full; dropped oldest frame");
                    let _ = frame_tx.try_send(frame);
                }
            }
            Ok(None) => {
                tracing::info!("capture source reached end of stream");
                break;
            }
            Err(DeviceError::Cancelled) => break,
            Err(err) => {
                state.fail(err.into());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    // Dropping the sender lets the embed stage drain and finish cleanly.
}

/// Embed + transmit stage: watermark each frame, monitor it on the sidetone
/// device, and stream it to the callee.
fn embed_send_loop(
    embedder: WatermarkEmbedder,
    mut sidetone: Box<dyn PlaybackDevice>,
    mut sender: FrameSender,
    frame_rx: Receiver<AudioFrame>,
    poll: std::time::Duration,
    shutdown: Arc<AtomicBool>,
    state: Arc<StateCell>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match frame_rx.recv_timeout(poll) {
            Ok(frame) => {
                let marked = match embedder.embed(&frame) {
                    Ok(marked) => marked,
                    Err(err) => {
                        state.fail(err.into());
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                };
                match sidetone.write_frame(&marked) {
                    Ok(()) => {}
                    Err(DeviceError::Cancelled) => break,
                    Err(err) => {
                        state.fail(err.into());
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                if let Err(err) = sender.send(&marked) {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    state.fail(err.into());
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                // Clean capture end: tell the callee the stream is over.
                sender.disconnect();
                break;
            }
        }
    }
    sidetone.close();
}
