//! Audio frame types and rate conversion.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sample rates negotiated somewhere in this pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// Canonical STT input rate
    #[default]
    Hz16000,
    /// Common TTS provider output rate
    Hz24000,
    /// Opus / WebRTC transport rate
    Hz48000,
}

impl SampleRate {
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Samples in a 20ms chunk at this rate.
    pub fn frame_size_20ms(&self) -> usize {
        (self.as_u32() as usize * 20) / 1000
    }

    pub fn samples_per_ms(&self) -> usize {
        self.as_u32() as usize / 1000
    }

    pub fn from_u32(rate: u32) -> Option<Self> {
        match rate {
            16000 => Some(SampleRate::Hz16000),
            24000 => Some(SampleRate::Hz24000),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }
}

/// Channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(&self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

const PCM16_NORMALIZE: f32 = 32768.0;
const PCM16_SCALE: f32 = 32767.0;
const SILENCE_FLOOR_DB: f32 = -96.0;

/// One chunk of audio flowing through the pipeline.
///
/// Samples are stored as normalized f32 in `[-1.0, 1.0]`; PCM16 conversion
/// happens only at the transport and provider edges.
#[derive(Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: SampleRate,
    pub channels: Channels,
    /// Sequence number for ordering within one direction of one session.
    pub sequence: u64,
    /// Capture (inbound) or synthesis (outbound) instant.
    pub timestamp: Instant,
    pub duration: Duration,
    /// RMS energy in dB, computed at construction.
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("duration", &self.duration)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

impl AudioFrame {
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        let duration = Duration::from_secs_f64(
            samples.len() as f64 / (sample_rate.as_u32() as f64 * channels.count() as f64),
        );
        let energy_db = Self::energy_db_of(&samples);

        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            sequence,
            timestamp: Instant::now(),
            duration,
            energy_db,
        }
    }

    fn energy_db_of(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return SILENCE_FLOOR_DB;
        }
        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_squares / samples.len() as f32).sqrt();
        if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            SILENCE_FLOOR_DB
        }
    }

    /// Decode little-endian PCM16 bytes.
    pub fn from_pcm16(
        bytes: &[u8],
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|chunk| {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                sample as f32 / PCM16_NORMALIZE
            })
            .collect();
        Self::new(samples, sample_rate, channels, sequence)
    }

    /// Encode to little-endian PCM16 bytes.
    pub fn to_pcm16(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                let pcm16 = (clamped * PCM16_SCALE) as i16;
                pcm16.to_le_bytes()
            })
            .collect()
    }

    /// Resample to `target_rate` using an FFT resampler, falling back to
    /// linear interpolation for frames too short to window.
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate {
            return self.clone();
        }

        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        let from_rate = self.sample_rate.as_u32() as usize;
        let to_rate = target_rate.as_u32() as usize;
        let chunk_size = self.samples.len().min(1024);
        let samples_f64: Vec<f64> = self.samples.iter().map(|&s| s as f64).collect();

        match FftFixedIn::<f64>::new(from_rate, to_rate, chunk_size, 2, 1) {
            Ok(mut resampler) => match resampler.process(&[samples_f64], None) {
                Ok(output) => {
                    let resampled: Vec<f32> = output[0].iter().map(|&s| s as f32).collect();
                    Self::new(resampled, target_rate, self.channels, self.sequence)
                }
                Err(e) => {
                    tracing::warn!("fft resample failed, using linear fallback: {}", e);
                    self.resample_linear(target_rate)
                }
            },
            Err(e) => {
                tracing::warn!("fft resampler init failed, using linear fallback: {}", e);
                self.resample_linear(target_rate)
            }
        }
    }

    fn resample_linear(&self, target_rate: SampleRate) -> Self {
        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = (src_idx - idx_floor as f64) as f32;

            let sample = self.samples[idx_floor] * (1.0 - frac) + self.samples[idx_ceil] * frac;
            resampled.push(sample);
        }

        Self::new(resampled, target_rate, self.channels, self.sequence)
    }

    /// Average stereo down to mono.
    pub fn to_mono(&self) -> Self {
        if self.channels == Channels::Mono {
            return self.clone();
        }
        let mono: Vec<f32> = self
            .samples
            .chunks_exact(2)
            .map(|chunk| (chunk[0] + chunk[1]) / 2.0)
            .collect();
        Self::new(mono, self.sample_rate, Channels::Mono, self.sequence)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn is_likely_silence(&self, threshold_db: f32) -> bool {
        self.energy_db < threshold_db
    }

    /// Split into chunks of at most `chunk_samples`, renumbering sequences.
    pub fn split(&self, chunk_samples: usize) -> Vec<AudioFrame> {
        let mut chunks = Vec::new();
        let mut seq = self.sequence;
        for chunk in self.samples.chunks(chunk_samples) {
            chunks.push(AudioFrame::new(
                chunk.to_vec(),
                self.sample_rate,
                self.channels,
                seq,
            ));
            seq += 1;
        }
        chunks
    }
}
