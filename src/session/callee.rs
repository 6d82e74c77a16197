//! Callee session: receive, play back, detect, aggregate.

use super::{SessionState, StateCell};
use crate::aggregate::{ResultAggregator, ResultObserver};
use crate::config::PipelineConfig;
use crate::device::{AudioBackend, CancelToken, CpalBackend, PlaybackDevice};
use crate::error::{DeviceError, TransportError, WatermarkError};
use crate::frame::AudioFrame;
use crate::lock_or_recover;
use crate::model::Network;
use crate::transport::{FrameListener, LinkShutdown, Received};
use crate::watermark::WatermarkDetector;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callee-side session: serves one caller at a time, plays the received
/// stream, and reports watermark probabilities to the registered observer.
pub struct ServerSession {
    param_path: PathBuf,
    weight_path: PathBuf,
    config: PipelineConfig,
    backend: Arc<dyn AudioBackend>,
    state: Arc<StateCell>,
    aggregator: Arc<ResultAggregator>,
    runtime: Option<CalleeRuntime>,
}

struct CalleeRuntime {
    threads: Vec<JoinHandle<()>>,
    playback_cancel: CancelToken,
    listener_cancel: CancelToken,
    conn_cancel: Arc<Mutex<Option<CancelToken>>>,
    conn_shutdown: Arc<Mutex<Option<LinkShutdown>>>,
    shutdown: Arc<AtomicBool>,
}

struct QueuedFrame {
    frame: AudioFrame,
    /// Gap (dropped/missing frames) accumulated ahead of this frame.
    missing: u64,
}

impl ServerSession {
    /// Create a callee around a detection model pair. The model is loaded
    /// during `start()`, not here.
    pub fn new(param_path: impl Into<PathBuf>, weight_path: impl Into<PathBuf>) -> Self {
        let config = PipelineConfig::default();
        let aggregator = Arc::new(ResultAggregator::new(
            config.window,
            config.delivery_interval,
        ));
        Self {
            param_path: param_path.into(),
            weight_path: weight_path.into(),
            config,
            backend: Arc::new(CpalBackend::new()),
            state: StateCell::new(),
            aggregator,
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.aggregator = Arc::new(ResultAggregator::new(
            config.window,
            config.delivery_interval,
        ));
        self.config = config;
        self
    }

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

    /// Register the (instantaneous, average) observer. May be called before
    /// or after `start()`; the callback runs on the delivery thread.
    pub fn set_result_observer(
        &self,
        observer: impl Fn(f32, f32) + Send + 'static,
    ) -> Result<(), WatermarkError> {
        if self.state.get() == SessionState::Disposed {
            return Err(WatermarkError::Disposed);
        }
        self.aggregator
            .set_observer(Some(Box::new(observer) as ResultObserver));
        Ok(())
    }

    /// Latest gap count, for diagnostics and tests.
    pub fn gap_count(&self) -> u64 {
        self.aggregator.gap_count()
    }

    /// Load the model, open playback, start listening, and go `Active`.
    /// Calling `start()` on an already running session is a no-op.
    pub fn start(&mut self, play_device: usize) -> Result<(), WatermarkError> {
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
        match self.start_inner(play_device) {
            Ok(runtime) => {
                self.runtime = Some(runtime);
                self.state.set(SessionState::Active);
                tracing::info!("callee session active on port {}", self.config.effective_port());
                Ok(())
            }
            Err(err) => {
                self.aggregator.reset();
                self.state.store_error(err.clone());
                self.state.set(SessionState::Idle);
                Err(err)
            }
        }
    }

    fn start_inner(&mut self, play_device: usize) -> Result<CalleeRuntime, WatermarkError> {
        let config = &self.config;

        let network = Network::load(&self.param_path, &self.weight_path)?;
        let detector = WatermarkDetector::new(network, config.frame_samples)?;

        let playback =
            self.backend
                .open_playback(play_device, config.sample_rate, config.frame_samples)?;
        let playback_cancel = playback.cancel_token();

        let listener = FrameListener::bind(
            "0.0.0.0",
            config.effective_port(),
            config.sample_rate,
            config.poll_interval,
        )?;
        let listener_cancel = listener.cancel_token();

        let (queue_tx, queue_rx) = bounded::<QueuedFrame>(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let conn_cancel: Arc<Mutex<Option<CancelToken>>> = Arc::new(Mutex::new(None));
        let conn_shutdown: Arc<Mutex<Option<LinkShutdown>>> = Arc::new(Mutex::new(None));

        self.aggregator.begin();

        let receive_thread = {
            let shutdown = shutdown.clone();
            let state = self.state.clone();
            let conn_cancel = conn_cancel.clone();
            let conn_shutdown = conn_shutdown.clone();
            let drop_rx = queue_rx.clone();
            thread::spawn(move || {
                receive_loop(
                    listener,
                    queue_tx,
                    drop_rx,
                    conn_cancel,
                    conn_shutdown,
                    shutdown,
                    state,
                )
            })
        };
        let detect_thread = {
            let shutdown = shutdown.clone();
            let state = self.state.clone();
            let aggregator = self.aggregator.clone();
            let poll = config.poll_interval;
            thread::spawn(move || {
                detect_loop(detector, playback, aggregator, queue_rx, poll, shutdown, state)
            })
        };

        Ok(CalleeRuntime {
            threads: vec![receive_thread, detect_thread],
            playback_cancel,
            listener_cancel,
            conn_cancel,
            conn_shutdown,
            shutdown,
        })
    }

    /// Idempotent stop: unblock and join every stage thread, release
    /// resources, reset the aggregator. `stop()` from `Idle` is a no-op.
    pub fn stop(&mut self) -> Result<(), WatermarkError> {
        match self.state.get() {
            SessionState::Disposed => return Err(WatermarkError::Disposed),
            SessionState::Idle => return Ok(()),
            _ => {}
        }
        self.state.set(SessionState::Stopping);
        self.teardown();
        self.aggregator.reset();
        self.state.set(SessionState::Idle);
        tracing::info!("callee session stopped");
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
            runtime.listener_cancel.cancel();
            if let Some(cancel) = lock_or_recover(&runtime.conn_cancel, "conn cancel").as_ref() {
                cancel.cancel();
            }
            if let Some(link) = lock_or_recover(&runtime.conn_shutdown, "conn shutdown").as_ref() {
                link.shutdown();
            }
            runtime.playback_cancel.cancel();
            for handle in runtime.threads {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.state.get() != SessionState::Disposed {
            let _ = self.stop();
        }
    }
}

/// Receive stage: accept one caller at a time and pump its frames into the
/// bounded detect queue, dropping the oldest frame under backpressure and
/// folding the loss into the next frame's gap count. A clean EOF loops back
/// to accepting the next caller; a receive error fails the session.
fn receive_loop(
    listener: FrameListener,
    queue_tx: Sender<QueuedFrame>,
    drop_rx: Receiver<QueuedFrame>,
    conn_cancel: Arc<Mutex<Option<CancelToken>>>,
    conn_shutdown: Arc<Mutex<Option<LinkShutdown>>>,
    shutdown: Arc<AtomicBool>,
    state: Arc<StateCell>,
) {
    'accept: loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut receiver = match listener.accept() {
            Ok(receiver) => receiver,
            Err(TransportError::Cancelled) => break,
            Err(err) => {
                state.fail(err.into());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        };
        *lock_or_recover(&conn_cancel, "conn cancel") = Some(receiver.cancel_token());
        if let Ok(handle) = receiver.shutdown_handle() {
            *lock_or_recover(&conn_shutdown, "conn shutdown") = Some(handle);
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break 'accept;
            }
            match receiver.receive() {
                Ok(Received::Frame { frame, missing }) => {
                    match queue_tx.try_send(QueuedFrame { frame, missing }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(mut item)) => {
                            if let Ok(dropped) = drop_rx.try_recv() {
                                // The evicted frame and its recorded gap fold
                                // into this frame's gap count.
                                item.missing += dropped.missing + 1;
                            }
                            tracing::debug!("detect queue full; dropped oldest frame");
                            let _ = queue_tx.try_send(item);
                        }
                        Err(TrySendError::Disconnected(_)) => break 'accept,
                    }
                }
                Ok(Received::Eof) => {
                    tracing::info!("caller stream ended; waiting for a new connection");
                    continue 'accept;
                }
                Err(TransportError::Cancelled) => break 'accept,
                Err(err) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break 'accept;
                    }
                    state.fail(err.into());
                    shutdown.store(true, Ordering::SeqCst);
                    break 'accept;
                }
            }
        }
    }
}

/// Detect stage: play each received frame, score it, and feed the
/// aggregator (gaps first, so the average accounting never lags the data).
fn detect_loop(
    detector: WatermarkDetector,
    mut playback: Box<dyn PlaybackDevice>,
    aggregator: Arc<ResultAggregator>,
    queue_rx: Receiver<QueuedFrame>,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
    state: Arc<StateCell>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match queue_rx.recv_timeout(poll) {
            Ok(item) => {
                if item.missing > 0 {
                    aggregator.push_gap(item.missing);
                }
                match playback.write_frame(&item.frame) {
                    Ok(()) => {}
                    Err(DeviceError::Cancelled) => break,
                    Err(err) => {
                        state.fail(err.into());
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                match detector.detect(&item.frame) {
                    Ok(sample) => aggregator.push(sample),
                    Err(err) => {
                        state.fail(err.into());
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    playback.close();
}
