//! The frame taxonomy exchanged between pipeline stages.
//!
//! Frames flow downstream (peer toward speaker); `Interrupt` flows upstream.
//! Stages select on the tag and pass unknown frames through unchanged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::AudioFrame;
use crate::error::ErrorKind;

/// A transcription hypothesis, interim or final.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Transcript {
    pub text: String,
    /// Opaque provider speaker label, passed through unchanged.
    pub speaker_id: Option<String>,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            speaker_id: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_speaker(mut self, speaker_id: impl Into<String>) -> Self {
        self.speaker_id = Some(speaker_id.into());
        self
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A structured function-invocation request emitted by the LLM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub turn_id: u64,
}

/// The resolution of a [`ToolCall`], keyed by `call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub turn_id: u64,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, value: serde_json::Value) -> Self {
        Self {
            call_id: call.call_id.clone(),
            turn_id: call.turn_id,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            turn_id: call.turn_id,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Why a turn was preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// User started speaking during assistant output.
    BargeIn,
    /// A downstream provider failed mid-turn.
    ProviderFailure,
    /// Session teardown.
    SessionClosing,
}

/// Metric kinds recorded per stage. A missing metric means the stage did not
/// run for that turn; the store never fabricates zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    SttTtfb,
    Recall,
    LlmTtfb,
    TtsTtfb,
    TurnTotal,
    GateSuppress,
    Drop,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::SttTtfb => "stt_ttfb",
            MetricKind::Recall => "recall",
            MetricKind::LlmTtfb => "llm_ttfb",
            MetricKind::TtsTtfb => "tts_ttfb",
            MetricKind::TurnTotal => "turn_total",
            MetricKind::GateSuppress => "gate_suppress",
            MetricKind::Drop => "drop",
        }
    }
}

/// One measurement, attributed to a stage and (usually) a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub stage: String,
    pub kind: MetricKind,
    /// Milliseconds for latency kinds; count for `Drop`; absent for marker
    /// kinds like `GateSuppress`.
    pub value: Option<f64>,
    pub turn_id: Option<u64>,
    pub timestamp_ms: u64,
}

impl MetricEvent {
    pub fn latency(stage: impl Into<String>, kind: MetricKind, ms: f64, turn_id: u64) -> Self {
        Self {
            stage: stage.into(),
            kind,
            value: Some(ms),
            turn_id: Some(turn_id),
            timestamp_ms: now_ms(),
        }
    }

    pub fn marker(stage: impl Into<String>, kind: MetricKind, turn_id: u64) -> Self {
        Self {
            stage: stage.into(),
            kind,
            value: None,
            turn_id: Some(turn_id),
            timestamp_ms: now_ms(),
        }
    }

    pub fn drop_count(stage: impl Into<String>, count: u64) -> Self {
        Self {
            stage: stage.into(),
            kind: MetricKind::Drop,
            value: Some(count as f64),
            turn_id: None,
            timestamp_ms: now_ms(),
        }
    }
}

/// Control frames for pipeline management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Flush pending buffered state (e.g. a partial sentence).
    Flush,
    /// Reset per-turn stage state.
    Reset,
    /// Run one unsolicited assistant turn (the session-start introduction).
    Greet,
}

/// The unit of inter-stage communication.
#[derive(Debug, Clone)]
pub enum Frame {
    /// PCM audio from the peer, canonical 16kHz mono.
    AudioInput(AudioFrame),
    /// Synthesized audio headed for the peer.
    AudioOutput(AudioFrame),
    /// VAD: speech onset.
    UserSpeechStarted,
    /// VAD: speech offset after the hangover window.
    UserSpeechStopped { duration_ms: u64 },
    /// Streaming transcription hypothesis; replaceable.
    SttInterim(Transcript),
    /// The single final transcript that opens a turn.
    SttFinal { transcript: Transcript, turn_id: u64 },
    /// Streaming assistant token(s).
    AssistantDelta { text: String, turn_id: u64 },
    /// Complete assistant response text.
    AssistantFinal { text: String, turn_id: u64 },
    /// A complete utterance unit ready for synthesis.
    Sentence {
        text: String,
        index: usize,
        turn_id: u64,
    },
    /// First synthesized audio frame of the turn was emitted.
    TtsStarted { turn_id: u64 },
    /// Last synthesized audio frame of the turn was flushed (or cancelled).
    TtsStopped { turn_id: u64 },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    /// Upstream preemption. Idempotent within a turn.
    Interrupt {
        reason: InterruptReason,
        turn_id: u64,
    },
    Metric(Arc<MetricEvent>),
    Error {
        stage: String,
        kind: ErrorKind,
        detail: String,
    },
    Control(ControlFrame),
    /// End of stream; stages flush and stop after propagating it.
    End,
}

impl Frame {
    pub fn is_end(&self) -> bool {
        matches!(self, Frame::End)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error { .. })
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Frame::Interrupt { .. })
    }

    /// Tag name used in logs and drop metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::AudioInput(_) => "audio_input",
            Frame::AudioOutput(_) => "audio_output",
            Frame::UserSpeechStarted => "user_speech_started",
            Frame::UserSpeechStopped { .. } => "user_speech_stopped",
            Frame::SttInterim(_) => "stt_interim",
            Frame::SttFinal { .. } => "stt_final",
            Frame::AssistantDelta { .. } => "assistant_delta",
            Frame::AssistantFinal { .. } => "assistant_final",
            Frame::Sentence { .. } => "sentence",
            Frame::TtsStarted { .. } => "tts_started",
            Frame::TtsStopped { .. } => "tts_stopped",
            Frame::ToolCall(_) => "tool_call",
            Frame::ToolResult(_) => "tool_result",
            Frame::Interrupt { .. } => "interrupt",
            Frame::Metric(_) => "metric",
            Frame::Error { .. } => "error",
            Frame::Control(_) => "control",
            Frame::End => "end",
        }
    }

    /// The turn this frame belongs to, when it carries one.
    pub fn turn_id(&self) -> Option<u64> {
        match self {
            Frame::SttFinal { turn_id, .. }
            | Frame::AssistantDelta { turn_id, .. }
            | Frame::AssistantFinal { turn_id, .. }
            | Frame::Sentence { turn_id, .. }
            | Frame::TtsStarted { turn_id }
            | Frame::TtsStopped { turn_id }
            | Frame::Interrupt { turn_id, .. } => Some(*turn_id),
            Frame::ToolCall(call) => Some(call.turn_id),
            Frame::ToolResult(result) => Some(result.turn_id),
            Frame::Metric(metric) => metric.turn_id,
            _ => None,
        }
    }
}
