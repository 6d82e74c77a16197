//! Probing-signal synthesis and WAV signal-file input.
//!
//! The caller plays a multitone probing signal in the 16.0-17.5 kHz band to
//! give the embedding network ultrasonic headroom. This module synthesizes
//! that multitone and provides the file-backed frame source used when a
//! session is configured to transmit a fixed signal file instead of live
//! microphone input.

use crate::device::{CancelToken, CaptureDevice, DeviceGuard};
use crate::error::{DeviceError, SignalFileError};
use crate::frame::AudioFrame;
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

/// Probing multitone frequencies (Hz).
pub const PROBE_TONES_HZ: [f32; 6] = [16_000.0, 16_300.0, 16_600.0, 16_900.0, 17_200.0, 17_500.0];

/// Peak amplitude of the summed probing signal.
pub const PROBE_AMPLITUDE: f32 = 0.8;

/// Fill `out` with the probing multitone, phase-continuous from
/// `start_sample`. The per-tone amplitude is `amplitude / tone count` so the
/// summed peak stays below `amplitude`.
pub fn fill_multitone(sample_rate: u32, amplitude: f32, start_sample: u64, out: &mut [f32]) {
    let per_tone = amplitude / PROBE_TONES_HZ.len() as f32;
    for (i, sample) in out.iter_mut().enumerate() {
        let t = (start_sample + i as u64) as f64 / sample_rate as f64;
        let mut acc = 0.0f64;
        for hz in PROBE_TONES_HZ {
            acc += (2.0 * std::f64::consts::PI * hz as f64 * t).sin();
        }
        *sample = (acc as f32) * per_tone;
    }
}

/// Fill `out` with a single sine tone, phase-continuous from `start_sample`.
pub fn fill_tone(sample_rate: u32, hz: f32, amplitude: f32, start_sample: u64, out: &mut [f32]) {
    for (i, sample) in out.iter_mut().enumerate() {
        let t = (start_sample + i as u64) as f64 / sample_rate as f64;
        *sample = (2.0 * std::f64::consts::PI * hz as f64 * t).sin() as f32 * amplitude;
    }
}

/// Synthesize a multitone buffer of the given duration.
pub fn multitone_buffer(sample_rate: u32, duration: Duration, amplitude: f32) -> Vec<f32> {
    let len = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
    let mut out = vec![0.0f32; len];
    fill_multitone(sample_rate, amplitude, 0, &mut out);
    out
}

/// Write a mono 16-bit multitone WAV, for the self-test path and tests.
pub fn write_multitone_wav(
    path: &Path,
    sample_rate: u32,
    duration: Duration,
    amplitude: f32,
) -> Result<(), SignalFileError> {
    let samples = multitone_buffer(sample_rate, duration, amplitude);
    let pcm: Vec<i16> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut file =
        File::create(path).map_err(|err| SignalFileError::Unreadable(err.to_string()))?;
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file)
        .map_err(|err| SignalFileError::Unreadable(err.to_string()))
}

/// Frame source backed by a fixed mono WAV file.
///
/// Stands in for the capture device when a session transmits a pre-recorded
/// signal. Frames are paced in real time like a live device so downstream
/// timing behaves identically; EOF either loops or cleanly ends the stream
/// per configuration.
#[derive(Debug)]
pub struct SignalFileSource {
    samples: Vec<f32>,
    pos: usize,
    seq: u64,
    sample_rate: u32,
    frame_samples: usize,
    looping: bool,
    paced: bool,
    next_due: Instant,
    cancel: CancelToken,
    _guard: DeviceGuard,
}

impl SignalFileSource {
    /// Open and fully decode the signal file, failing fast on a missing or
    /// unreadable file or a sample-rate/channel/format mismatch.
    pub fn open(
        path: &Path,
        expected_rate: u32,
        frame_samples: usize,
        looping: bool,
    ) -> Result<Self, SignalFileError> {
        let mut file = File::open(path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                SignalFileError::Missing(path.display().to_string())
            } else {
                SignalFileError::Unreadable(format!("{}: {err}", path.display()))
            }
        })?;
        let (header, data) = wav::read(&mut file)
            .map_err(|err| SignalFileError::Unreadable(format!("{}: {err}", path.display())))?;
        if header.channel_count != 1 {
            return Err(SignalFileError::IncompatibleFormat(format!(
                "expected mono, got {} channels",
                header.channel_count
            )));
        }
        if header.sampling_rate != expected_rate {
            return Err(SignalFileError::IncompatibleFormat(format!(
                "expected {expected_rate} Hz, got {} Hz",
                header.sampling_rate
            )));
        }
        let samples: Vec<f32> = match data {
            wav::BitDepth::Eight(raw) => raw
                .into_iter()
                .map(|s| (s as f32 - 128.0) / 128.0)
                .collect(),
            wav::BitDepth::Sixteen(raw) => {
                raw.into_iter().map(|s| s as f32 / 32_768.0).collect()
            }
            wav::BitDepth::TwentyFour(raw) => raw
                .into_iter()
                .map(|s| s as f32 / 8_388_608.0)
                .collect(),
            wav::BitDepth::ThirtyTwoFloat(raw) => raw,
            wav::BitDepth::Empty => Vec::new(),
        };
        if samples.is_empty() {
            return Err(SignalFileError::IncompatibleFormat(
                "signal file contains no samples".to_string(),
            ));
        }
        Ok(Self {
            samples,
            pos: 0,
            seq: 0,
            sample_rate: expected_rate,
            frame_samples,
            looping,
            paced: true,
            next_due: Instant::now(),
            cancel: CancelToken::new(),
            _guard: DeviceGuard::acquire(),
        })
    }

    /// Disable real-time pacing (tests only want the data).
    pub fn with_pacing(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_samples as f64 / self.sample_rate as f64)
    }

    fn wait_until_due(&mut self) -> Result<(), DeviceError> {
        if !self.paced {
            return Ok(());
        }
        loop {
            if self.cancel.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            let now = Instant::now();
            if now >= self.next_due {
                self.next_due += self.frame_duration();
                return Ok(());
            }
            std::thread::sleep((self.next_due - now).min(Duration::from_millis(10)));
        }
    }
}

impl CaptureDevice for SignalFileSource {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        if self.pos >= self.samples.len() {
            if !self.looping {
                return Ok(None);
            }
            self.pos = 0;
        }
        self.wait_until_due()?;

        let mut frame = Vec::with_capacity(self.frame_samples);
        while frame.len() < self.frame_samples {
            let remaining = self.frame_samples - frame.len();
            let available = self.samples.len() - self.pos;
            let take = remaining.min(available);
            frame.extend_from_slice(&self.samples[self.pos..self.pos + take]);
            self.pos += take;
            if self.pos >= self.samples.len() {
                if self.looping {
                    self.pos = 0;
                } else {
                    // Zero-pad the tail; the next read reports end of stream.
                    frame.resize(self.frame_samples, 0.0);
                    break;
                }
            }
        }
        let seq = self.seq;
        self.seq += 1;
        Ok(Some(AudioFrame::new(seq, self.sample_rate, frame)))
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}
