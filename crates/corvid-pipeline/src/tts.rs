//! TTS stage: streamed synthesis per utterance unit.
//!
//! Each `Sentence` is synthesized in arrival order; audio frames are
//! resampled to the transport rate and emitted as they stream in.
//! `TtsStarted` marks the turn's first outgoing frame, `TtsStopped` the
//! flush or cancellation. A provider failure never retries in-band: the turn
//! is interrupted and the next turn starts clean.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corvid_core::{
    Frame, FrameProcessor, FrameSender, InterruptReason, MetricEvent, MetricKind,
    ProcessorContext, Result, TextToSpeech,
};
use corvid_transport::TRANSPORT_RATE;

use crate::control::TurnControl;

#[derive(Default)]
struct TtsTurnState {
    turn_id: u64,
    started: bool,
    first_unit_at: Option<Instant>,
}

pub struct TtsStage {
    provider: Arc<dyn TextToSpeech>,
    control: Arc<TurnControl>,
    state: Mutex<TtsTurnState>,
    /// Wind-down budget for an interrupted synthesis.
    abort_grace: Duration,
}

impl TtsStage {
    pub fn new(
        provider: Arc<dyn TextToSpeech>,
        control: Arc<TurnControl>,
        abort_grace: Duration,
    ) -> Self {
        Self {
            provider,
            control,
            state: Mutex::new(TtsTurnState::default()),
            abort_grace,
        }
    }

    async fn synthesize_unit(
        &self,
        text: &str,
        turn_id: u64,
        out: &FrameSender,
    ) -> Result<()> {
        let cancel = self
            .control
            .token(turn_id)
            .unwrap_or_else(CancellationToken::new);

        {
            let mut state = self.state.lock();
            if state.turn_id != turn_id {
                *state = TtsTurnState {
                    turn_id,
                    ..Default::default()
                };
            }
            if state.first_unit_at.is_none() {
                state.first_unit_at = Some(Instant::now());
            }
        }

        let (audio_tx, mut audio_rx) = mpsc::channel(32);
        let provider = self.provider.clone();
        let text = text.to_string();
        let synth_cancel = cancel.clone();
        let synth =
            tokio::spawn(async move { provider.synthesize(&text, audio_tx, synth_cancel).await });

        while let Some(frame) = audio_rx.recv().await {
            if self.control.is_interrupted(turn_id) {
                break;
            }

            let first = {
                let mut state = self.state.lock();
                if !state.started {
                    state.started = true;
                    true
                } else {
                    false
                }
            };
            if first {
                out.send(Frame::TtsStarted { turn_id }).await.ok();
                let ttfb = self
                    .state
                    .lock()
                    .first_unit_at
                    .map(|t| t.elapsed().as_secs_f64() * 1_000.0)
                    .unwrap_or(0.0);
                out.send(Frame::Metric(Arc::new(MetricEvent::latency(
                    "tts",
                    MetricKind::TtsTtfb,
                    ttfb,
                    turn_id,
                ))))
                .await
                .ok();
            }

            let frame = if frame.sample_rate == TRANSPORT_RATE {
                frame
            } else {
                frame.resample(TRANSPORT_RATE)
            };
            out.send(Frame::AudioOutput(frame)).await.ok();
        }

        // Closing the receiver makes a well-behaved provider return at its
        // next send; the join is bounded by the abort grace either way.
        drop(audio_rx);
        let synth_abort = synth.abort_handle();
        match tokio::time::timeout(self.abort_grace, synth).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) if cancel.is_cancelled() => {
                tracing::debug!(turn_id, error = %e, "synthesis cancelled");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                // No in-band retry on the audio path: interrupt the turn.
                tracing::error!(turn_id, error = %e, "synthesis failed, aborting turn");
                self.control.interrupt(turn_id);
                out.send(Frame::Interrupt {
                    reason: InterruptReason::ProviderFailure,
                    turn_id,
                })
                .await
                .ok();
                self.finish_turn(turn_id, out).await;
                Err(e)
            }
            Ok(Err(e)) => Err(corvid_core::CoreError::Invariant(format!("tts task: {}", e))),
            Err(_) => {
                tracing::warn!(turn_id, "synthesis wind-down exceeded abort grace");
                synth_abort.abort();
                Ok(())
            }
        }
    }

    /// Emit `TtsStopped` once per started turn and release the turn.
    async fn finish_turn(&self, turn_id: u64, out: &FrameSender) {
        let started = {
            let mut state = self.state.lock();
            let started = state.started && state.turn_id == turn_id;
            if state.turn_id == turn_id {
                *state = TtsTurnState::default();
            }
            started
        };
        if started {
            out.send(Frame::TtsStopped { turn_id }).await.ok();
        }
        self.control.set_assistant_active(false);
        self.control.end_turn(turn_id);
    }
}

#[async_trait]
impl FrameProcessor for TtsStage {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            Frame::Sentence { text, turn_id, .. } => {
                if self.control.is_interrupted(turn_id) {
                    return Ok(());
                }
                if text.trim().is_empty() {
                    return Ok(());
                }
                self.synthesize_unit(&text, turn_id, out).await
            }
            Frame::AssistantFinal { text, turn_id } => {
                self.finish_turn(turn_id, out).await;
                out.send(Frame::AssistantFinal { text, turn_id }).await.ok();
                Ok(())
            }
            Frame::Interrupt { reason, turn_id } => {
                self.finish_turn(turn_id, out).await;
                out.send(Frame::Interrupt { reason, turn_id }).await.ok();
                Ok(())
            }
            Frame::Metric(_) | Frame::Error { .. } => Ok(()),
            other => {
                out.send(other).await.ok();
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "tts"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::{AudioFrame, Channels, SampleRate};

    /// Emits `frames_per_unit` 20ms frames per request, optionally failing.
    struct ScriptedTts {
        frames_per_unit: usize,
        fail: bool,
    }

    #[async_trait]
    impl TextToSpeech for ScriptedTts {
        fn output_rate(&self) -> SampleRate {
            SampleRate::Hz24000
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        async fn synthesize(
            &self,
            _text: &str,
            audio_tx: mpsc::Sender<AudioFrame>,
            cancel: CancellationToken,
        ) -> Result<()> {
            if self.fail {
                return Err(corvid_core::CoreError::Provider("tts 503".into()));
            }
            for seq in 0..self.frames_per_unit {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let frame = AudioFrame::new(
                    vec![0.1; SampleRate::Hz24000.frame_size_20ms()],
                    SampleRate::Hz24000,
                    Channels::Mono,
                    seq as u64,
                );
                if audio_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn stage(fail: bool) -> (TtsStage, Arc<TurnControl>) {
        let control = Arc::new(TurnControl::new());
        (
            TtsStage::new(
                Arc::new(ScriptedTts {
                    frames_per_unit: 3,
                    fail,
                }),
                control.clone(),
                Duration::from_millis(200),
            ),
            control,
        )
    }

    fn sentence(turn_id: u64, text: &str) -> Frame {
        Frame::Sentence {
            text: text.into(),
            index: 0,
            turn_id,
        }
    }

    async fn run(stage: &TtsStage, frames: Vec<Frame>) -> Vec<Frame> {
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(128);
        for frame in frames {
            let _ = stage.process(frame, &mut ctx, &tx).await;
        }
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_started_metric_audio_stopped() {
        let (stage, control) = stage(false);
        let turn = control.begin_turn();

        let output = run(
            &stage,
            vec![
                sentence(turn.turn_id, "Hello there."),
                Frame::AssistantFinal {
                    text: "Hello there.".into(),
                    turn_id: turn.turn_id,
                },
            ],
        )
        .await;

        let tags: Vec<&str> = output.iter().map(|f| f.tag()).collect();
        assert_eq!(tags.first(), Some(&"tts_started"));
        assert!(tags.contains(&"metric"));
        assert!(tags.contains(&"tts_stopped"));
        let audio_count = output
            .iter()
            .filter(|f| matches!(f, Frame::AudioOutput(_)))
            .count();
        assert_eq!(audio_count, 3);

        // Audio is resampled to the transport rate.
        for frame in &output {
            if let Frame::AudioOutput(audio) = frame {
                assert_eq!(audio.sample_rate, TRANSPORT_RATE);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_unit_never_synthesized() {
        let (stage, control) = stage(false);
        let turn = control.begin_turn();
        let output = run(&stage, vec![sentence(turn.turn_id, "   ")]).await;
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_turn_produces_no_audio() {
        let (stage, control) = stage(false);
        let turn = control.begin_turn();
        control.interrupt(turn.turn_id);

        let output = run(&stage, vec![sentence(turn.turn_id, "Too late.")]).await;
        assert!(!output.iter().any(|f| matches!(f, Frame::AudioOutput(_))));
    }

    #[tokio::test]
    async fn test_interrupt_frame_emits_stopped_once() {
        let (stage, control) = stage(false);
        let turn = control.begin_turn();

        let mut frames = vec![sentence(turn.turn_id, "First part of the answer.")];
        frames.push(Frame::Interrupt {
            reason: InterruptReason::BargeIn,
            turn_id: turn.turn_id,
        });
        // Redelivered interrupt.
        frames.push(Frame::Interrupt {
            reason: InterruptReason::BargeIn,
            turn_id: turn.turn_id,
        });
        let output = run(&stage, frames).await;

        let stopped = output
            .iter()
            .filter(|f| matches!(f, Frame::TtsStopped { .. }))
            .count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_provider_failure_interrupts_turn() {
        let (stage, control) = stage(true);
        let turn = control.begin_turn();

        let output = run(&stage, vec![sentence(turn.turn_id, "Doomed sentence.")]).await;

        assert!(output.iter().any(|f| matches!(
            f,
            Frame::Interrupt {
                reason: InterruptReason::ProviderFailure,
                ..
            }
        )));
        assert!(control.is_interrupted(turn.turn_id));
        assert!(!output.iter().any(|f| matches!(f, Frame::AudioOutput(_))));
    }
}
