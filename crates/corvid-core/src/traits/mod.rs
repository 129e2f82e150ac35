//! Provider and stage traits.
//!
//! Every external collaborator sits behind one of these seams so sessions can
//! be assembled from configuration and tested against mocks:
//!
//! - [`SpeechToText`] / [`SttSession`]: bidirectional audio → text stream
//! - [`TextToSpeech`]: streamed synthesis with mid-stream cancel
//! - [`LanguageModel`]: streamed chat with tool-call payloads
//! - [`GateClassifier`]: fast should-the-assistant-reply decision
//! - [`MemoryBackend`]: recall-on-turn and fire-and-forget store
//! - [`VisionAnalyzer`]: image + prompt → text
//! - [`FrameProcessor`]: one pipeline stage

mod llm;
mod memory;
mod pipeline;
mod speech;

pub use llm::{
    ChatRequest, FinishReason, GateClassifier, GateDecision, LanguageModel, LlmEvent,
    ToolDefinition,
};
pub use memory::{MemoryBackend, VisionAnalyzer};
pub use pipeline::{FrameProcessor, FrameSender, ProcessorContext};
pub use speech::{SpeechToText, SttEvent, SttSession, TextToSpeech};
