//! Opus encode/decode at the transport rate.

use parking_lot::Mutex;

use corvid_core::{AudioFrame, Channels, SampleRate};

use crate::TransportError;

/// Maximum Opus packet size we ever produce (well above 20ms voice needs).
const MAX_PACKET: usize = 1_500;
/// Maximum frame the decoder can hand back (120ms at 48kHz).
const MAX_DECODED: usize = 5_760;

/// Opus encoder, one per outbound track.
pub struct OpusEncoder {
    inner: Mutex<opus::Encoder>,
}

impl OpusEncoder {
    pub fn new(sample_rate: SampleRate) -> Result<Self, TransportError> {
        let encoder = opus::Encoder::new(
            sample_rate.as_u32(),
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| TransportError::Codec(format!("encoder init: {}", e)))?;

        Ok(Self {
            inner: Mutex::new(encoder),
        })
    }

    /// Encode one 20ms mono chunk.
    pub fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, TransportError> {
        let mut output = vec![0u8; MAX_PACKET];
        let written = self
            .inner
            .lock()
            .encode_float(samples, &mut output)
            .map_err(|e| TransportError::Codec(format!("encode: {}", e)))?;
        output.truncate(written);
        Ok(output)
    }
}

/// Opus decoder, one per inbound track.
pub struct OpusDecoder {
    inner: Mutex<opus::Decoder>,
}

impl OpusDecoder {
    pub fn new(sample_rate: SampleRate) -> Result<Self, TransportError> {
        let decoder = opus::Decoder::new(sample_rate.as_u32(), opus::Channels::Mono)
            .map_err(|e| TransportError::Codec(format!("decoder init: {}", e)))?;

        Ok(Self {
            inner: Mutex::new(decoder),
        })
    }

    pub fn decode(&self, packet: &[u8]) -> Result<Vec<f32>, TransportError> {
        let mut output = vec![0f32; MAX_DECODED];
        let decoded = self
            .inner
            .lock()
            .decode_float(packet, &mut output, false)
            .map_err(|e| TransportError::Codec(format!("decode: {}", e)))?;
        output.truncate(decoded);
        Ok(output)
    }

    /// Packet-loss concealment for a missing packet.
    pub fn decode_plc(&self) -> Result<Vec<f32>, TransportError> {
        let mut output = vec![0f32; MAX_DECODED];
        let decoded = self
            .inner
            .lock()
            .decode_float(&[], &mut output, false)
            .map_err(|e| TransportError::Codec(format!("plc: {}", e)))?;
        output.truncate(decoded);
        Ok(output)
    }
}

/// Accumulates arbitrary-length audio into exact 20ms packets for RTP.
pub struct Packetizer {
    buffer: Vec<f32>,
    packet_samples: usize,
    sequence: u64,
    sample_rate: SampleRate,
}

impl Packetizer {
    pub fn new(sample_rate: SampleRate) -> Self {
        Self {
            buffer: Vec::new(),
            packet_samples: sample_rate.frame_size_20ms(),
            sequence: 0,
            sample_rate,
        }
    }

    /// Push samples; returns every complete 20ms frame now available.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.packet_samples {
            let chunk: Vec<f32> = self.buffer.drain(..self.packet_samples).collect();
            frames.push(AudioFrame::new(
                chunk,
                self.sample_rate,
                Channels::Mono,
                self.sequence,
            ));
            self.sequence += 1;
        }
        frames
    }

    /// Flush the remainder, zero-padded to a full packet. Call at turn end.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut chunk: Vec<f32> = self.buffer.drain(..).collect();
        chunk.resize(self.packet_samples, 0.0);
        let frame = AudioFrame::new(chunk, self.sample_rate, Channels::Mono, self.sequence);
        self.sequence += 1;
        Some(frame)
    }
}
