//! Energy-based voice activity detection.
//!
//! Labels 20ms audio chunks as speech or non-speech and emits
//! `UserSpeechStarted` / `UserSpeechStopped` around the configured hangover.
//! Audio passes through unchanged for the STT stage.

use async_trait::async_trait;
use parking_lot::Mutex;

use corvid_config::VadConfig;
use corvid_core::{AudioFrame, Frame, FrameProcessor, FrameSender, ProcessorContext, Result};

#[derive(Debug, Default)]
struct VadState {
    in_speech: bool,
    /// Consecutive speech-energy milliseconds while idle.
    onset_ms: u64,
    /// Consecutive silence milliseconds while in speech.
    silence_ms: u64,
    /// Total speech duration of the current segment.
    speech_ms: u64,
}

pub struct VadStage {
    config: VadConfig,
    state: Mutex<VadState>,
}

impl VadStage {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: Mutex::new(VadState::default()),
        }
    }

    /// Classify one chunk; returns the boundary event to emit, if any.
    fn advance(&self, frame: &AudioFrame) -> Option<Frame> {
        let is_speech_energy = !frame.is_likely_silence(self.config.energy_floor_db);
        let chunk_ms = frame.duration_ms().max(1);
        let mut state = self.state.lock();

        if state.in_speech {
            if is_speech_energy {
                state.silence_ms = 0;
                state.speech_ms += chunk_ms;
                None
            } else {
                state.silence_ms += chunk_ms;
                if state.silence_ms >= self.config.silence_ms {
                    let duration_ms = state.speech_ms;
                    *state = VadState::default();
                    Some(Frame::UserSpeechStopped { duration_ms })
                } else {
                    // Inside the hangover: still counted as the utterance.
                    state.speech_ms += chunk_ms;
                    None
                }
            }
        } else if is_speech_energy {
            state.onset_ms += chunk_ms;
            if state.onset_ms >= self.config.min_speech_ms {
                state.in_speech = true;
                state.speech_ms = state.onset_ms;
                state.onset_ms = 0;
                state.silence_ms = 0;
                Some(Frame::UserSpeechStarted)
            } else {
                None
            }
        } else {
            state.onset_ms = 0;
            None
        }
    }
}

#[async_trait]
impl FrameProcessor for VadStage {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            Frame::AudioInput(audio) => {
                if let Some(event) = self.advance(&audio) {
                    tracing::debug!(event = event.tag(), "vad boundary");
                    out.send(event).await.ok();
                }
                out.send(Frame::AudioInput(audio)).await.ok();
            }
            Frame::Control(corvid_core::ControlFrame::Reset) => {
                *self.state.lock() = VadState::default();
                out.send(Frame::Control(corvid_core::ControlFrame::Reset))
                    .await
                    .ok();
            }
            other => {
                out.send(other).await.ok();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "vad"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::{Channels, SampleRate};

    fn loud_chunk(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.3; 320], SampleRate::Hz16000, Channels::Mono, seq)
    }

    fn quiet_chunk(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0001; 320], SampleRate::Hz16000, Channels::Mono, seq)
    }

    fn stage() -> VadStage {
        VadStage::new(VadConfig {
            silence_ms: 100,
            energy_floor_db: -45.0,
            min_speech_ms: 40,
        })
    }

    #[test]
    fn test_onset_requires_min_speech() {
        let vad = stage();
        // One 20ms chunk is below the 40ms onset threshold.
        assert!(vad.advance(&loud_chunk(0)).is_none());
        let event = vad.advance(&loud_chunk(1));
        assert!(matches!(event, Some(Frame::UserSpeechStarted)));
    }

    #[test]
    fn test_hangover_delays_stop() {
        let vad = stage();
        vad.advance(&loud_chunk(0));
        vad.advance(&loud_chunk(1));

        // Silence below the hangover: no stop yet.
        for i in 2..6 {
            assert!(vad.advance(&quiet_chunk(i)).is_none());
        }
        // Crossing 100ms of silence fires the stop.
        let event = vad.advance(&quiet_chunk(6));
        assert!(matches!(event, Some(Frame::UserSpeechStopped { .. })));
    }

    #[test]
    fn test_noise_blip_does_not_trigger() {
        let vad = stage();
        assert!(vad.advance(&loud_chunk(0)).is_none());
        // Silence resets the onset accumulator.
        assert!(vad.advance(&quiet_chunk(1)).is_none());
        assert!(vad.advance(&loud_chunk(2)).is_none());
    }

    #[test]
    fn test_stop_reports_duration() {
        let vad = stage();
        vad.advance(&loud_chunk(0));
        vad.advance(&loud_chunk(1));
        for i in 2..10 {
            if let Some(Frame::UserSpeechStopped { duration_ms }) = vad.advance(&quiet_chunk(i)) {
                assert!(duration_ms >= 40);
                return;
            }
        }
        panic!("no stop event");
    }
}
