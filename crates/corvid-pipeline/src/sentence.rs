//! Sentence splitting for TTS framing.
//!
//! Accumulates assistant deltas and emits complete utterance units as soon as
//! terminal punctuation appears. The first unit may be cut early at a word
//! boundary for latency; an oversized buffer is force-cut the same way. A
//! final flushes the remainder; an interrupt discards it.

use async_trait::async_trait;
use parking_lot::Mutex;

use corvid_core::{Frame, FrameProcessor, FrameSender, ProcessorContext, Result};

#[derive(Debug, Clone)]
pub struct SentenceSplitterConfig {
    /// A unit shorter than this is only emitted on flush.
    pub min_unit_chars: usize,
    /// Force a cut at a word boundary once the buffer grows past this.
    pub max_buffer_chars: usize,
}

impl Default for SentenceSplitterConfig {
    fn default() -> Self {
        use corvid_config::constants::sentence;
        Self {
            min_unit_chars: sentence::MIN_FIRST_UNIT_CHARS,
            max_buffer_chars: sentence::MAX_BUFFER_CHARS,
        }
    }
}

const TERMINATORS: &[char] = &['.', '!', '?', ';'];
const TRAILERS: &[char] = &['"', '\'', ')', ']', '\u{2019}', '\u{201d}'];

#[derive(Default)]
struct SplitterState {
    buffer: String,
    index: usize,
    turn_id: u64,
}

pub struct SentenceSplitter {
    config: SentenceSplitterConfig,
    state: Mutex<SplitterState>,
}

impl SentenceSplitter {
    pub fn new(config: SentenceSplitterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SplitterState::default()),
        }
    }

    /// Split `text` at terminal punctuation, keeping trailing quotes and
    /// brackets attached. Returns complete units and the remainder.
    fn find_units(&self, text: &str) -> (Vec<String>, String) {
        let mut units = Vec::new();
        let mut current = String::new();
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            current.push(c);
            i += 1;

            if !TERMINATORS.contains(&c) {
                continue;
            }
            // A dot inside a number ("3.5") is not a boundary.
            if c == '.'
                && i < chars.len()
                && chars[i].is_ascii_digit()
                && i >= 2
                && chars[i - 2].is_ascii_digit()
            {
                continue;
            }
            while i < chars.len() && TRAILERS.contains(&chars[i]) {
                current.push(chars[i]);
                i += 1;
            }

            let unit = current.trim().to_string();
            if unit.len() >= self.config.min_unit_chars {
                units.push(unit);
                current.clear();
            }
            // Too-short units keep accumulating into the next one.
        }

        (units, current)
    }

    /// Emit collected units as frames, advancing the per-turn index.
    fn unit_frames(&self, units: Vec<String>) -> Vec<Frame> {
        let mut state = self.state.lock();
        units
            .into_iter()
            .filter(|u| !u.trim().is_empty())
            .map(|text| {
                let frame = Frame::Sentence {
                    text,
                    index: state.index,
                    turn_id: state.turn_id,
                };
                state.index += 1;
                frame
            })
            .collect()
    }

    fn reset(&self) {
        *self.state.lock() = SplitterState::default();
    }
}

#[async_trait]
impl FrameProcessor for SentenceSplitter {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            Frame::AssistantDelta { text, turn_id } => {
                let pending = {
                    let mut state = self.state.lock();
                    if state.turn_id != turn_id {
                        // New turn: anything left over belongs to a dead one.
                        *state = SplitterState::default();
                        state.turn_id = turn_id;
                    }
                    state.buffer.push_str(&text);
                    let (units, mut rest) = self.find_units(&state.buffer);

                    // Oversized remainder: cut at the last word boundary.
                    let mut units = units;
                    if rest.len() > self.config.max_buffer_chars {
                        if let Some(pos) = rest.rfind(char::is_whitespace) {
                            let tail = rest.split_off(pos);
                            let head = std::mem::replace(&mut rest, tail.trim_start().to_string());
                            let head = head.trim().to_string();
                            if !head.is_empty() {
                                units.push(head);
                            }
                        }
                    }
                    state.buffer = rest;
                    units
                };

                for unit in self.unit_frames(pending) {
                    out.send(unit).await.ok();
                }
            }
            Frame::AssistantFinal { text, turn_id } => {
                let remainder = {
                    let mut state = self.state.lock();
                    state.turn_id = turn_id;
                    std::mem::take(&mut state.buffer)
                };
                let remainder = remainder.trim().to_string();
                if !remainder.is_empty() {
                    for unit in self.unit_frames(vec![remainder]) {
                        out.send(unit).await.ok();
                    }
                }
                self.reset();
                out.send(Frame::AssistantFinal { text, turn_id }).await.ok();
            }
            Frame::Interrupt { reason, turn_id } => {
                self.reset();
                out.send(Frame::Interrupt { reason, turn_id }).await.ok();
            }
            Frame::Control(corvid_core::ControlFrame::Flush) => {
                let remainder = std::mem::take(&mut self.state.lock().buffer);
                let remainder = remainder.trim().to_string();
                if !remainder.is_empty() {
                    for unit in self.unit_frames(vec![remainder]) {
                        out.send(unit).await.ok();
                    }
                }
            }
            Frame::Metric(_) | Frame::Error { .. } => {}
            other => {
                out.send(other).await.ok();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sentence_splitter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn splitter() -> SentenceSplitter {
        SentenceSplitter::new(SentenceSplitterConfig {
            min_unit_chars: 5,
            max_buffer_chars: 100,
        })
    }

    async fn feed(splitter: &SentenceSplitter, frames: Vec<Frame>) -> Vec<Frame> {
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(32);
        for frame in frames {
            splitter.process(frame, &mut ctx, &tx).await.unwrap();
        }
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn delta(text: &str) -> Frame {
        Frame::AssistantDelta {
            text: text.into(),
            turn_id: 1,
        }
    }

    fn sentences(frames: &[Frame]) -> Vec<(usize, String)> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Sentence { text, index, .. } => Some((*index, text.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unit_per_terminal_punctuation() {
        let s = splitter();
        let output = feed(
            &s,
            vec![delta("Tokyo is nine hours ahead. It is"), delta(" 9pm there now!")],
        )
        .await;

        let units = sentences(&output);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], (0, "Tokyo is nine hours ahead.".to_string()));
        assert_eq!(units[1], (1, "It is 9pm there now!".to_string()));
    }

    #[tokio::test]
    async fn test_final_flushes_remainder() {
        let s = splitter();
        let output = feed(
            &s,
            vec![
                delta("And one more thing"),
                Frame::AssistantFinal {
                    text: "And one more thing".into(),
                    turn_id: 1,
                },
            ],
        )
        .await;

        let units = sentences(&output);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].1, "And one more thing");
        assert!(output
            .iter()
            .any(|f| matches!(f, Frame::AssistantFinal { .. })));
    }

    #[tokio::test]
    async fn test_whitespace_only_never_emitted() {
        let s = splitter();
        let output = feed(
            &s,
            vec![
                delta("   "),
                Frame::AssistantFinal {
                    text: "   ".into(),
                    turn_id: 1,
                },
            ],
        )
        .await;
        assert!(sentences(&output).is_empty());
    }

    #[tokio::test]
    async fn test_decimal_number_not_split() {
        let s = splitter();
        let output = feed(&s, vec![delta("The rate is 3.5 percent today.")]).await;
        let units = sentences(&output);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].1, "The rate is 3.5 percent today.");
    }

    #[tokio::test]
    async fn test_interrupt_discards_pending() {
        let s = splitter();
        let output = feed(
            &s,
            vec![
                delta("Half a sentence without an end"),
                Frame::Interrupt {
                    reason: corvid_core::InterruptReason::BargeIn,
                    turn_id: 1,
                },
            ],
        )
        .await;
        assert!(sentences(&output).is_empty());
        assert!(output.iter().any(|f| f.is_interrupt()));
    }

    #[tokio::test]
    async fn test_short_fragment_accumulates() {
        let s = splitter();
        // "Hi." is below min_unit_chars; it joins the next sentence.
        let output = feed(&s, vec![delta("Hi. Good to see you again.")]).await;
        let units = sentences(&output);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].1, "Hi. Good to see you again.");
    }

    #[tokio::test]
    async fn test_oversized_buffer_force_cut() {
        let s = SentenceSplitter::new(SentenceSplitterConfig {
            min_unit_chars: 5,
            max_buffer_chars: 20,
        });
        let long_text = "word ".repeat(10); // 50 chars, no terminator
        let output = feed(&s, vec![delta(&long_text)]).await;
        assert!(!sentences(&output).is_empty());
    }
}
