//! Hardware-free audio backend for self-test and tests.
//!
//! Capture synthesizes a configured waveform; playback counts the frames it
//! sinks. The backend exposes one default device and one explicit device
//! (index 1) so invalid-index handling is exercisable without hardware.

use super::{AudioBackend, CancelToken, CaptureDevice, DeviceGuard, PlaybackDevice};
use crate::error::DeviceError;
use crate::frame::AudioFrame;
use crate::signal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_DEVICE_INDEX: usize = 1;

/// Waveform produced by a synthetic capture device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    Silence,
    Tone { hz: f32, amplitude: f32 },
    Multitone { amplitude: f32 },
}

/// Backend whose devices need no hardware.
#[derive(Clone)]
pub struct SyntheticBackend {
    waveform: Waveform,
    paced: bool,
    played: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub fn new(waveform: Waveform) -> Self {
        Self {
            waveform,
            paced: true,
            played: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Disable real-time pacing so tests run at full speed.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Total frames written to any playback device opened by this backend.
    pub fn frames_played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

impl AudioBackend for SyntheticBackend {
    fn open_capture(
        &self,
        device_index: usize,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if device_index > MAX_DEVICE_INDEX {
            return Err(DeviceError::NotFound(device_index));
        }
        Ok(Box::new(SyntheticCapture {
            waveform: self.waveform,
            sample_rate,
            frame_samples,
            seq: 0,
            position: 0,
            paced: self.paced,
            next_due: Instant::now(),
            cancel: CancelToken::new(),
            _guard: DeviceGuard::acquire(),
        }))
    }

    fn open_playback(
        &self,
        device_index: usize,
        _sample_rate: u32,
        _frame_samples: usize,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        if device_index > MAX_DEVICE_INDEX {
            return Err(DeviceError::NotFound(device_index));
        }
        Ok(Box::new(SyntheticPlayback {
            played: self.played.clone(),
            cancel: CancelToken::new(),
            _guard: DeviceGuard::acquire(),
        }))
    }

    fn capture_device_names(&self) -> Result<Vec<String>, DeviceError> {
        Ok(vec!["synthetic source".to_string()])
    }

    fn playback_device_names(&self) -> Result<Vec<String>, DeviceError> {
        Ok(vec!["synthetic sink".to_string()])
    }
}

struct SyntheticCapture {
    waveform: Waveform,
    sample_rate: u32,
    frame_samples: usize,
    seq: u64,
    /// Absolute sample offset, keeps the waveform phase-continuous.
    position: u64,
    paced: bool,
    next_due: Instant,
    cancel: CancelToken,
    _guard: DeviceGuard,
}

impl SyntheticCapture {
    fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_samples as f64 / self.sample_rate as f64)
    }
}

impl CaptureDevice for SyntheticCapture {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        if self.paced {
            loop {
                if self.cancel.is_cancelled() {
                    return Err(DeviceError::Cancelled);
                }
                let now = Instant::now();
                if now >= self.next_due {
                    self.next_due += self.frame_duration();
                    break;
                }
                std::thread::sleep((self.next_due - now).min(Duration::from_millis(10)));
            }
        } else if self.cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }

        let mut samples = vec![0.0f32; self.frame_samples];
        match self.waveform {
            Waveform::Silence => {}
            Waveform::Tone { hz, amplitude } => {
                signal::fill_tone(self.sample_rate, hz, amplitude, self.position, &mut samples);
            }
            Waveform::Multitone { amplitude } => {
                signal::fill_multitone(self.sample_rate, amplitude, self.position, &mut samples);
            }
        }
        self.position += self.frame_samples as u64;
        let seq = self.seq;
        self.seq += 1;
        Ok(Some(AudioFrame::new(seq, self.sample_rate, samples)))
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

struct SyntheticPlayback {
    played: Arc<AtomicUsize>,
    cancel: CancelToken,
    _guard: DeviceGuard,
}

impl PlaybackDevice for SyntheticPlayback {
    fn write_frame(&mut self, _frame: &AudioFrame) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag;

    #[test]
    fn tone_capture_produces_sequential_frames() {
        let _diag = crate::diag::test_lock();
        let backend = SyntheticBackend::new(Waveform::Tone {
            hz: 440.0,
            amplitude: 0.5,
        })
        .unpaced();
        let mut capture = backend.open_capture(0, 48_000, 256).expect("open");
        let first = capture.read_frame().expect("read").expect("frame");
        let second = capture.read_frame().expect("read").expect("frame");
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(first.samples.len(), 256);
        assert!(first.rms_db() > -20.0);
    }

    #[test]
    fn invalid_index_is_not_found() {
        let _diag = crate::diag::test_lock();
        let backend = SyntheticBackend::new(Waveform::Silence).unpaced();
        let err = backend.open_capture(5, 48_000, 256).err().expect("fail");
        assert_eq!(err, DeviceError::NotFound(5));
        let err = backend.open_playback(9, 48_000, 256).err().expect("fail");
        assert_eq!(err, DeviceError::NotFound(9));
    }

    #[test]
    fn playback_counts_frames_across_devices() {
        let _diag = crate::diag::test_lock();
        let backend = SyntheticBackend::new(Waveform::Silence).unpaced();
        let mut playback = backend.open_playback(0, 48_000, 256).expect("open");
        let frame = AudioFrame::new(0, 48_000, vec![0.0; 256]);
        playback.write_frame(&frame).expect("write");
        playback.write_frame(&frame).expect("write");
        assert_eq!(backend.frames_played(), 2);
    }

    #[test]
    fn cancelled_capture_returns_cancelled() {
        let _diag = crate::diag::test_lock();
        let backend = SyntheticBackend::new(Waveform::Silence).unpaced();
        let mut capture = backend.open_capture(0, 48_000, 128).expect("open");
        capture.cancel_token().cancel();
        assert_eq!(capture.read_frame().unwrap_err(), DeviceError::Cancelled);
    }

    #[test]
    fn dropping_devices_releases_the_counter() {
        let _diag = crate::diag::test_lock();
        let before = diag::open_devices();
        let backend = SyntheticBackend::new(Waveform::Silence).unpaced();
        {
            let _capture = backend.open_capture(0, 48_000, 128).expect("open");
            let _playback = backend.open_playback(0, 48_000, 128).expect("open");
            assert_eq!(diag::open_devices(), before + 2);
        }
        assert_eq!(diag::open_devices(), before);
    }
}
