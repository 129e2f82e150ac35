//! Silence-response filter.
//!
//! A second line of defence behind the gate: when the model decides not to
//! answer it emits exactly `{"action": "silence"}`. Deltas are held back
//! while the accumulated text is still a prefix of that sentinel; the moment
//! it diverges everything buffered is released. A final that matches the
//! sentinel is swallowed whole, so nothing reaches TTS.

use async_trait::async_trait;
use parking_lot::Mutex;

use corvid_core::{Frame, FrameProcessor, FrameSender, ProcessorContext, Result};

const SILENCE_SENTINELS: &[&str] = &["{\"action\": \"silence\"}", "{\"action\":\"silence\"}"];

#[derive(Default)]
struct FilterState {
    /// Deltas withheld while the sentinel is still possible.
    held: Vec<Frame>,
    accumulated: String,
    /// Sentinel ruled out; pass deltas straight through.
    released: bool,
}

pub struct SilenceFilter {
    state: Mutex<FilterState>,
}

impl SilenceFilter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FilterState::default()),
        }
    }

    fn could_be_sentinel(text: &str) -> bool {
        let trimmed = text.trim_start();
        SILENCE_SENTINELS
            .iter()
            .any(|s| s.starts_with(trimmed) || trimmed.starts_with(s))
    }

    fn is_sentinel(text: &str) -> bool {
        let trimmed = text.trim();
        SILENCE_SENTINELS.contains(&trimmed)
    }
}

impl Default for SilenceFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameProcessor for SilenceFilter {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            Frame::AssistantDelta { text, turn_id } => {
                let release = {
                    let mut state = self.state.lock();
                    if state.released {
                        None
                    } else {
                        state.accumulated.push_str(&text);
                        if Self::could_be_sentinel(&state.accumulated) {
                            state.held.push(Frame::AssistantDelta {
                                text: text.clone(),
                                turn_id,
                            });
                            Some(Vec::new())
                        } else {
                            state.released = true;
                            let mut held = std::mem::take(&mut state.held);
                            held.push(Frame::AssistantDelta {
                                text: text.clone(),
                                turn_id,
                            });
                            Some(held)
                        }
                    }
                };

                match release {
                    None => {
                        out.send(Frame::AssistantDelta { text, turn_id }).await.ok();
                    }
                    Some(held) => {
                        for held_frame in held {
                            out.send(held_frame).await.ok();
                        }
                    }
                }
            }
            Frame::AssistantFinal { text, turn_id } => {
                let suppress = Self::is_sentinel(&text);
                *self.state.lock() = FilterState::default();

                if suppress {
                    tracing::info!(turn_id, "suppressing silent response");
                } else {
                    out.send(Frame::AssistantFinal { text, turn_id }).await.ok();
                }
            }
            Frame::Interrupt { reason, turn_id } => {
                *self.state.lock() = FilterState::default();
                out.send(Frame::Interrupt { reason, turn_id }).await.ok();
            }
            Frame::Metric(_) | Frame::Error { .. } => {}
            other => {
                out.send(other).await.ok();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "silence_filter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn feed(filter: &SilenceFilter, frames: Vec<Frame>) -> Vec<Frame> {
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);
        for frame in frames {
            filter.process(frame, &mut ctx, &tx).await.unwrap();
        }
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn delta(text: &str) -> Frame {
        Frame::AssistantDelta {
            text: text.into(),
            turn_id: 1,
        }
    }

    #[tokio::test]
    async fn test_silence_json_fully_suppressed() {
        let filter = SilenceFilter::new();
        let output = feed(
            &filter,
            vec![
                delta("{\"action\""),
                delta(": \"silence\"}"),
                Frame::AssistantFinal {
                    text: "{\"action\": \"silence\"}".into(),
                    turn_id: 1,
                },
            ],
        )
        .await;

        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_normal_response_passes_with_order_preserved() {
        let filter = SilenceFilter::new();
        let output = feed(
            &filter,
            vec![
                delta("Hello "),
                delta("there!"),
                Frame::AssistantFinal {
                    text: "Hello there!".into(),
                    turn_id: 1,
                },
            ],
        )
        .await;

        let texts: Vec<String> = output
            .iter()
            .filter_map(|f| match f {
                Frame::AssistantDelta { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Hello ", "there!"]);
        assert!(output
            .iter()
            .any(|f| matches!(f, Frame::AssistantFinal { .. })));
    }

    #[tokio::test]
    async fn test_brace_opening_released_on_divergence() {
        // A response that merely starts with '{' is held then released.
        let filter = SilenceFilter::new();
        let output = feed(
            &filter,
            vec![delta("{\"act"), delta("ually, yes.")],
        )
        .await;

        let combined: String = output
            .iter()
            .filter_map(|f| match f {
                Frame::AssistantDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(combined, "{\"actually, yes.");
    }

    #[tokio::test]
    async fn test_interrupt_clears_buffer() {
        let filter = SilenceFilter::new();
        let output = feed(
            &filter,
            vec![
                delta("{\"action\""),
                Frame::Interrupt {
                    reason: corvid_core::InterruptReason::BargeIn,
                    turn_id: 1,
                },
                // Next turn's normal text flows immediately.
                delta("Sure."),
            ],
        )
        .await;

        assert!(output.iter().any(|f| f.is_interrupt()));
        // Held sentinel-prefix deltas from the aborted turn stay dropped;
        // the new turn's delta is held only while ambiguous.
        assert!(!output
            .iter()
            .any(|f| matches!(f, Frame::AssistantDelta { text, .. } if text.contains("action"))));
    }
}
