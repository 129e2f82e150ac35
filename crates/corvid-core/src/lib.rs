//! Core types for the corvid voice pipeline.
//!
//! This crate provides the foundations shared by every other crate:
//! - The [`Frame`] taxonomy exchanged between pipeline stages
//! - Audio frame types, PCM16 conversion, and resampling
//! - The conversation [`Context`] with token-budget eviction
//! - Provider traits for pluggable STT/LLM/TTS/memory/vision backends
//! - Error types with recovery-policy classification

pub mod audio;
pub mod context;
pub mod error;
pub mod frame;
pub mod traits;

pub use audio::{AudioFrame, Channels, SampleRate};
pub use context::{Context, Message, Role};
pub use error::{CoreError, ErrorKind, Result};
pub use frame::{
    ControlFrame, Frame, InterruptReason, MetricEvent, MetricKind, ToolCall, ToolResult,
    Transcript,
};
pub use traits::{
    ChatRequest, FinishReason, FrameProcessor, FrameSender, GateClassifier, GateDecision,
    LanguageModel, LlmEvent, MemoryBackend, ProcessorContext, SpeechToText, SttEvent, SttSession,
    TextToSpeech, ToolDefinition, VisionAnalyzer,
};
