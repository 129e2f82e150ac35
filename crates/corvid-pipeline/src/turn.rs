//! Turn aggregation.
//!
//! Holds interim transcripts until speech has stopped and either the latest
//! interim has been stable for the stabilise window or the hard deadline
//! passes, then cuts exactly one `SttFinal` carrying a fresh monotone turn
//! id. Barge-in: speech onset while the assistant is producing audio
//! interrupts the active turn out-of-band (token) and in-band (frame).
//!
//! Raw audio stops here; downstream stages are text-only.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corvid_config::TurnConfig;
use corvid_core::{
    Frame, FrameProcessor, FrameSender, InterruptReason, ProcessorContext, Result, Transcript,
};

use crate::control::TurnControl;

#[derive(Default)]
struct AggregatorState {
    latest: Option<Transcript>,
    last_change: Option<Instant>,
    speech_stopped_at: Option<Instant>,
    speech_started_at: Option<Instant>,
    /// Speech onset → first interim, reported as the turn's STT TTFB.
    first_interim_ms: Option<f64>,
}

pub struct TurnAggregator {
    config: TurnConfig,
    control: Arc<TurnControl>,
    state: Mutex<AggregatorState>,
}

impl TurnAggregator {
    pub fn new(config: TurnConfig, control: Arc<TurnControl>) -> Self {
        Self {
            config,
            control,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    /// Cut the final if the stabilise window or hard deadline has elapsed.
    /// Returns the `SttFinal` plus the turn's STT first-byte metric.
    fn maybe_cut(&self) -> Vec<Frame> {
        let mut state = self.state.lock();
        let Some(stopped_at) = state.speech_stopped_at else {
            return Vec::new();
        };

        let stable = state
            .last_change
            .map(|t| t.elapsed() >= Duration::from_millis(self.config.stabilise_ms))
            .unwrap_or(true);
        let deadline = stopped_at.elapsed() >= Duration::from_millis(self.config.hard_deadline_ms);

        if !stable && !deadline {
            return Vec::new();
        }

        let transcript = state.latest.take();
        let first_interim_ms = state.first_interim_ms;
        *state = AggregatorState::default();
        drop(state);

        let Some(transcript) = transcript else {
            return Vec::new();
        };
        if transcript.text.trim().is_empty() {
            return Vec::new();
        }

        let turn = self.control.begin_turn();
        tracing::info!(
            turn_id = turn.turn_id,
            text = %transcript.text,
            "turn final cut"
        );

        let mut frames = vec![Frame::SttFinal {
            transcript,
            turn_id: turn.turn_id,
        }];
        if let Some(ms) = first_interim_ms {
            frames.push(Frame::Metric(Arc::new(
                corvid_core::MetricEvent::latency("stt", corvid_core::MetricKind::SttTtfb, ms, turn.turn_id),
            )));
        }
        frames
    }

    fn barge_in(&self) -> Option<Frame> {
        if !self.control.assistant_active() {
            return None;
        }
        let turn_id = self.control.current_turn();
        if self.control.interrupt(turn_id) {
            tracing::info!(turn_id, "barge-in, interrupting assistant turn");
            Some(Frame::Interrupt {
                reason: InterruptReason::BargeIn,
                turn_id,
            })
        } else {
            None
        }
    }
}

#[async_trait]
impl FrameProcessor for TurnAggregator {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            // Interims are held here; observers already saw them on the bus
            // at the STT stage's emission. Nothing downstream consumes them.
            Frame::SttInterim(transcript) => {
                {
                    let mut state = self.state.lock();
                    if state.first_interim_ms.is_none() {
                        if let Some(onset) = state.speech_started_at {
                            state.first_interim_ms =
                                Some(onset.elapsed().as_secs_f64() * 1_000.0);
                        }
                    }
                    let changed = state
                        .latest
                        .as_ref()
                        .map(|prev| prev.text != transcript.text)
                        .unwrap_or(true);
                    if changed {
                        state.last_change = Some(Instant::now());
                    }
                    state.latest = Some(transcript);
                }
                for frame in self.maybe_cut() {
                    out.send(frame).await.ok();
                }
            }
            // Speech boundaries end here too: the bus carried them to the
            // observers at the VAD's emission, and barge-in is resolved at
            // this stage.
            Frame::UserSpeechStarted => {
                {
                    let mut state = self.state.lock();
                    if state.speech_started_at.is_none() {
                        state.speech_started_at = Some(Instant::now());
                    }
                }
                if let Some(interrupt) = self.barge_in() {
                    out.send(interrupt).await.ok();
                }
            }
            Frame::UserSpeechStopped { .. } => {
                self.state.lock().speech_stopped_at = Some(Instant::now());
            }
            // Every frame arrival doubles as a clock tick; audio flows at
            // 20ms intervals, bounding final-cut delay.
            Frame::AudioInput(_) => {
                for frame in self.maybe_cut() {
                    out.send(frame).await.ok();
                }
                // Raw audio terminates here.
            }
            Frame::Error { stage, kind, detail } => {
                // Already on the observer bus at emission.
                let _ = (stage, kind, detail);
            }
            other => {
                out.send(other).await.ok();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "turn_aggregator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::{AudioFrame, Channels, SampleRate};
    use tokio::sync::mpsc;

    fn aggregator(control: Arc<TurnControl>) -> TurnAggregator {
        TurnAggregator::new(
            TurnConfig {
                stabilise_ms: 30,
                hard_deadline_ms: 200,
                ..Default::default()
            },
            control,
        )
    }

    fn audio() -> Frame {
        Frame::AudioInput(AudioFrame::new(
            vec![0.0; 320],
            SampleRate::Hz16000,
            Channels::Mono,
            0,
        ))
    }

    async fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_final_cut_after_stabilise() {
        let control = Arc::new(TurnControl::new());
        let agg = aggregator(control.clone());
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);

        agg.process(Frame::SttInterim(Transcript::new("what time is it")), &mut ctx, &tx)
            .await
            .unwrap();
        agg.process(Frame::UserSpeechStopped { duration_ms: 900 }, &mut ctx, &tx)
            .await
            .unwrap();

        // Before the stabilise window: ticks produce no final.
        agg.process(audio(), &mut ctx, &tx).await.unwrap();
        assert!(!drain(&mut rx)
            .await
            .iter()
            .any(|f| matches!(f, Frame::SttFinal { .. })));

        tokio::time::sleep(Duration::from_millis(40)).await;
        agg.process(audio(), &mut ctx, &tx).await.unwrap();

        let frames = drain(&mut rx).await;
        let final_frame = frames
            .iter()
            .find(|f| matches!(f, Frame::SttFinal { .. }))
            .expect("final after stabilise");
        if let Frame::SttFinal { transcript, turn_id } = final_frame {
            assert_eq!(transcript.text, "what time is it");
            assert_eq!(*turn_id, 1);
        }
    }

    #[tokio::test]
    async fn test_one_final_per_turn() {
        let control = Arc::new(TurnControl::new());
        let agg = aggregator(control.clone());
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);

        agg.process(Frame::SttInterim(Transcript::new("hello")), &mut ctx, &tx)
            .await
            .unwrap();
        agg.process(Frame::UserSpeechStopped { duration_ms: 500 }, &mut ctx, &tx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        for _ in 0..5 {
            agg.process(audio(), &mut ctx, &tx).await.unwrap();
        }

        let finals = drain(&mut rx)
            .await
            .into_iter()
            .filter(|f| matches!(f, Frame::SttFinal { .. }))
            .count();
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn test_empty_transcript_never_finalizes() {
        let control = Arc::new(TurnControl::new());
        let agg = aggregator(control.clone());
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);

        agg.process(Frame::SttInterim(Transcript::new("   ")), &mut ctx, &tx)
            .await
            .unwrap();
        agg.process(Frame::UserSpeechStopped { duration_ms: 100 }, &mut ctx, &tx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        agg.process(audio(), &mut ctx, &tx).await.unwrap();

        assert!(!drain(&mut rx)
            .await
            .iter()
            .any(|f| matches!(f, Frame::SttFinal { .. })));
        assert_eq!(control.current_turn(), 0);
    }

    #[tokio::test]
    async fn test_barge_in_interrupts_active_turn() {
        let control = Arc::new(TurnControl::new());
        let turn = control.begin_turn();
        control.set_assistant_active(true);

        let agg = aggregator(control.clone());
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);

        agg.process(Frame::UserSpeechStarted, &mut ctx, &tx)
            .await
            .unwrap();

        let frames = drain(&mut rx).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::Interrupt {
                reason: InterruptReason::BargeIn,
                ..
            }
        )));
        assert!(turn.cancel.is_cancelled());

        // Redelivered onset: idempotent, no second interrupt.
        agg.process(Frame::UserSpeechStarted, &mut ctx, &tx)
            .await
            .unwrap();
        let frames = drain(&mut rx).await;
        assert!(!frames.iter().any(|f| f.is_interrupt()));
    }

    #[tokio::test]
    async fn test_hard_deadline_cuts_with_churning_interims() {
        let control = Arc::new(TurnControl::new());
        let agg = TurnAggregator::new(
            TurnConfig {
                stabilise_ms: 10_000, // never stable
                hard_deadline_ms: 50,
                ..Default::default()
            },
            control,
        );
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);

        agg.process(Frame::SttInterim(Transcript::new("one")), &mut ctx, &tx)
            .await
            .unwrap();
        agg.process(Frame::UserSpeechStopped { duration_ms: 300 }, &mut ctx, &tx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        agg.process(Frame::SttInterim(Transcript::new("one two")), &mut ctx, &tx)
            .await
            .unwrap();

        assert!(drain(&mut rx)
            .await
            .iter()
            .any(|f| matches!(f, Frame::SttFinal { .. })));
    }
}
