//! Language-model and gate-classifier traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::Message;
use crate::error::Result;

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema object for the arguments.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    /// The model paused to request tool invocations.
    ToolUse,
    Cancelled,
}

/// Streamed completion events, in model order. Token order is preserved
/// end-to-end; partial text is never reordered.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Delta(String),
    ToolCallRequest {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Done(FinishReason),
}

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Streaming chat provider with tool-call support.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Stream one completion. Events go to `events`; the implementation must
    /// cancel the in-flight request promptly when `cancel` fires and finish
    /// with `Done(Cancelled)` without emitting further deltas.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<LlmEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Outcome of the reply gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Suppress,
}

/// Fast classifier deciding whether an utterance addresses the assistant.
#[async_trait]
pub trait GateClassifier: Send + Sync {
    async fn classify(
        &self,
        utterance: &str,
        speaker_id: Option<&str>,
        recent_turns: &[Message],
    ) -> Result<GateDecision>;
}
