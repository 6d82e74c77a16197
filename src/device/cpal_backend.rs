//! Hardware audio backend built on cpal.
//!
//! cpal delivers and consumes samples on callback threads, and its streams
//! are not `Send`. Each opened device therefore spawns a worker thread that
//! owns the stream and bridges it to blocking frame I/O over bounded
//! channels: capture callbacks chunk samples into frames and `try_send`
//! (dropping when the consumer lags, never blocking the callback), playback
//! callbacks drain queued frames and zero-fill on underrun.

use super::{AudioBackend, CancelToken, CaptureDevice, DeviceGuard, PlaybackDevice};
use crate::error::DeviceError;
use crate::frame::AudioFrame;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(200);
const CHANNEL_FRAMES: usize = 32;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend over the host's real audio devices.
#[derive(Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        device_index: usize,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let host = cpal::default_host();
        let device = resolve_device(&host, device_index, Role::Capture)?;
        let (frame_tx, frame_rx) = bounded::<Vec<f32>>(CHANNEL_FRAMES);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped_worker = dropped.clone();

        let worker = thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || {
                let stream =
                    match build_input_stream(&device, sample_rate, frame_samples, frame_tx, dropped_worker) {
                        Ok(stream) => stream,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Backend(err.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until close; the stream must stay alive on this thread.
                let _ = stop_rx.recv();
                if let Err(err) = stream.pause() {
                    tracing::debug!("failed to pause capture stream: {err}");
                }
            })
            .map_err(|err| DeviceError::Backend(err.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = stop_tx.try_send(());
                return Err(DeviceError::Backend(
                    "timed out opening capture stream".to_string(),
                ));
            }
        }

        Ok(Box::new(CpalCapture {
            frames: frame_rx,
            stop_tx,
            worker: Some(worker),
            cancel: CancelToken::new(),
            sample_rate,
            seq: 0,
            dropped,
            _guard: DeviceGuard::acquire(),
        }))
    }

    fn open_playback(
        &self,
        device_index: usize,
        sample_rate: u32,
        _frame_samples: usize,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        let host = cpal::default_host();
        let device = resolve_device(&host, device_index, Role::Playback)?;
        let (sample_tx, sample_rx) = bounded::<Vec<f32>>(CHANNEL_FRAMES);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);

        let worker = thread::Builder::new()
            .name("cpal-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(&device, sample_rate, sample_rx) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Backend(err.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                if let Err(err) = stream.pause() {
                    tracing::debug!("failed to pause playback stream: {err}");
                }
            })
            .map_err(|err| DeviceError::Backend(err.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = stop_tx.try_send(());
                return Err(DeviceError::Backend(
                    "timed out opening playback stream".to_string(),
                ));
            }
        }

        Ok(Box::new(CpalPlayback {
            samples: sample_tx,
            stop_tx,
            worker: Some(worker),
            cancel: CancelToken::new(),
            _guard: DeviceGuard::acquire(),
        }))
    }

    fn capture_device_names(&self) -> Result<Vec<String>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|err| DeviceError::Backend(err.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn playback_device_names(&self) -> Result<Vec<String>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|err| DeviceError::Backend(err.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

#[derive(Copy, Clone)]
enum Role {
    Capture,
    Playback,
}

/// Index 0 selects the platform default; explicit indices are 1-based into
/// the enumeration order.
fn resolve_device(
    host: &cpal::Host,
    index: usize,
    role: Role,
) -> Result<cpal::Device, DeviceError> {
    match role {
        Role::Capture => {
            if index == super::DEFAULT_DEVICE {
                host.default_input_device()
                    .ok_or(DeviceError::NotFound(index))
            } else {
                let mut devices = host
                    .input_devices()
                    .map_err(|err| DeviceError::Backend(err.to_string()))?;
                devices.nth(index - 1).ok_or(DeviceError::NotFound(index))
            }
        }
        Role::Playback => {
            if index == super::DEFAULT_DEVICE {
                host.default_output_device()
                    .ok_or(DeviceError::NotFound(index))
            } else {
                let mut devices = host
                    .output_devices()
                    .map_err(|err| DeviceError::Backend(err.to_string()))?;
                devices.nth(index - 1).ok_or(DeviceError::NotFound(index))
            }
        }
    }
}

/// Accumulates callback buffers into fixed-size frames and hands them to the
/// blocking reader. A full channel drops the frame and counts it; the
/// callback never blocks.
struct FrameChunker {
    frame_samples: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    sender: Sender<Vec<f32>>,
    dropped: Arc<AtomicUsize>,
}

impl FrameChunker {
    fn new(frame_samples: usize, sender: Sender<Vec<f32>>, dropped: Arc<AtomicUsize>) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
            scratch: Vec::new(),
            sender,
            dropped,
        }
    }

    fn push<T, F>(&mut self, data: &[T], channels: usize, convert: F)
    where
        T: Copy,
        F: FnMut(T) -> f32,
    {
        self.scratch.clear();
        downmix_into(&mut self.scratch, data, channels, convert);
        self.pending.extend_from_slice(&self.scratch);
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            if let Err(err) = self.sender.try_send(frame) {
                match err {
                    TrySendError::Full(_) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    TrySendError::Disconnected(_) => break,
                }
            }
        }
    }
}

/// Average interleaved channels down to mono while converting to f32.
fn downmix_into<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }
    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

fn build_input_stream(
    device: &cpal::Device,
    sample_rate: u32,
    frame_samples: usize,
    sender: Sender<Vec<f32>>,
    dropped: Arc<AtomicUsize>,
) -> Result<cpal::Stream, DeviceError> {
    let default_config = device
        .default_input_config()
        .map_err(|err| DeviceError::Backend(err.to_string()))?;
    let format = default_config.sample_format();
    let channels = usize::from(default_config.channels().max(1));
    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let mut chunker = FrameChunker::new(frame_samples, sender, dropped);
    let err_fn = |err| tracing::warn!("capture stream error: {err}");

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| chunker.push(data, channels, |sample| sample),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                chunker.push(data, channels, |sample| sample as f32 / 32_768.0)
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _| {
                chunker.push(data, channels, |sample| {
                    (sample as f32 - 32_768.0) / 32_768.0
                })
            },
            err_fn,
            None,
        ),
        other => {
            return Err(DeviceError::UnsupportedFormat(format!(
                "capture sample format {other:?}"
            )))
        }
    };
    stream.map_err(|err| DeviceError::UnsupportedFormat(err.to_string()))
}

/// Feeds queued frames into the output callback, replicating mono samples
/// across the device's channels and zero-filling on underrun.
struct OutputFeeder {
    receiver: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    pos: usize,
    channels: usize,
}

impl OutputFeeder {
    fn next_sample(&mut self) -> f32 {
        if self.pos >= self.pending.len() {
            match self.receiver.try_recv() {
                Ok(frame) => {
                    self.pending = frame;
                    self.pos = 0;
                }
                Err(_) => return 0.0,
            }
            if self.pending.is_empty() {
                return 0.0;
            }
        }
        let sample = self.pending[self.pos];
        self.pos += 1;
        sample
    }

    fn fill_f32(&mut self, data: &mut [f32]) {
        for chunk in data.chunks_mut(self.channels.max(1)) {
            let sample = self.next_sample();
            for slot in chunk {
                *slot = sample;
            }
        }
    }

    fn fill_i16(&mut self, data: &mut [i16]) {
        for chunk in data.chunks_mut(self.channels.max(1)) {
            let sample = (self.next_sample().clamp(-1.0, 1.0) * 32_767.0) as i16;
            for slot in chunk {
                *slot = sample;
            }
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    sample_rate: u32,
    receiver: Receiver<Vec<f32>>,
) -> Result<cpal::Stream, DeviceError> {
    let default_config = device
        .default_output_config()
        .map_err(|err| DeviceError::Backend(err.to_string()))?;
    let format = default_config.sample_format();
    let channels = usize::from(default_config.channels().max(1));
    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let mut feeder = OutputFeeder {
        receiver,
        pending: Vec::new(),
        pos: 0,
        channels,
    };
    let err_fn = |err| tracing::warn!("playback stream error: {err}");

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| feeder.fill_f32(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| feeder.fill_i16(data),
            err_fn,
            None,
        ),
        other => {
            return Err(DeviceError::UnsupportedFormat(format!(
                "playback sample format {other:?}"
            )))
        }
    };
    stream.map_err(|err| DeviceError::UnsupportedFormat(err.to_string()))
}

struct CpalCapture {
    frames: Receiver<Vec<f32>>,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
    cancel: CancelToken,
    sample_rate: u32,
    seq: u64,
    dropped: Arc<AtomicUsize>,
    _guard: DeviceGuard,
}

impl CaptureDevice for CpalCapture {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            match self.frames.recv_timeout(POLL) {
                Ok(samples) => {
                    let seq = self.seq;
                    self.seq += 1;
                    let dropped = self.dropped.swap(0, Ordering::Relaxed);
                    if dropped > 0 {
                        tracing::debug!("capture dropped {dropped} frame(s) under backpressure");
                    }
                    return Ok(Some(AudioFrame::new(seq, self.sample_rate, samples)));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::Backend(
                        "capture stream disconnected".to_string(),
                    ))
                }
            }
        }
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn close(&mut self) {
        self.cancel.cancel();
        let _ = self.stop_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

struct CpalPlayback {
    samples: Sender<Vec<f32>>,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
    cancel: CancelToken,
    _guard: DeviceGuard,
}

impl PlaybackDevice for CpalPlayback {
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), DeviceError> {
        let mut samples = frame.samples.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            match self.samples.send_timeout(samples, POLL) {
                Ok(()) => return Ok(()),
                Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => samples = back,
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                    return Err(DeviceError::Backend(
                        "playback stream disconnected".to_string(),
                    ))
                }
            }
        }
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn close(&mut self) {
        self.cancel.cancel();
        let _ = self.stop_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_stereo_pairs() {
        let mut buf = Vec::new();
        downmix_into(&mut buf, &[1.0f32, -1.0, 0.5, 0.5], 2, |s| s);
        assert_eq!(buf, vec![0.0, 0.5]);
    }

    #[test]
    fn chunker_emits_fixed_frames_and_counts_drops() {
        let (tx, rx) = bounded::<Vec<f32>>(1);
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut chunker = FrameChunker::new(4, tx, dropped.clone());
        chunker.push(&[0.1f32; 12], 1, |s| s);
        // Capacity 1: the first frame lands, the next two are dropped.
        assert_eq!(rx.try_recv().expect("frame").len(), 4);
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn output_feeder_zero_fills_on_underrun() {
        let (tx, rx) = bounded::<Vec<f32>>(2);
        tx.send(vec![0.5, 0.25]).expect("queue frame");
        let mut feeder = OutputFeeder {
            receiver: rx,
            pending: Vec::new(),
            pos: 0,
            channels: 2,
        };
        let mut out = [0.0f32; 8];
        feeder.fill_f32(&mut out);
        // Two queued mono samples replicated to stereo, then silence.
        assert_eq!(&out[..4], &[0.5, 0.5, 0.25, 0.25]);
        assert_eq!(&out[4..], &[0.0; 4]);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn default_capture_device_opens() {
        let backend = CpalBackend::new();
        let mut capture = backend.open_capture(0, 48_000, 512).expect("open capture");
        let frame = capture.read_frame().expect("read").expect("frame");
        assert_eq!(frame.samples.len(), 512);
        capture.close();
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn device_names_are_listable() {
        let backend = CpalBackend::new();
        let names = backend.capture_device_names().expect("list");
        println!("capture devices: {names:?}");
    }
}
