//! The conversation pipeline.
//!
//! A per-session directed graph of stages exchanging frames over bounded
//! queues: VAD → STT → turn aggregator → gate → memory → LLM → silence
//! filter → sentence splitter → TTS. Observers tap every edge read-only and
//! publish to the peer's data channel; the metrics store keeps per-turn
//! first-byte latencies.

mod assembler;
mod chain;
mod control;
mod gate;
mod llm;
mod memory;
mod metrics;
mod observer;
pub mod providers;
mod sentence;
mod silence;
mod stt;
mod tts;
mod turn;
mod vad;

pub use assembler::{Assembler, PipelineHandle, ProviderSet};
pub use chain::ProcessorChain;
pub use control::{TurnControl, TurnHandle};
pub use gate::GateStage;
pub use llm::LlmStage;
pub use memory::MemoryStage;
pub use metrics::{MetricsStore, TurnMetrics};
pub use observer::{spawn_observers, ObserverDeps, PeerSink};
pub use providers::{HttpStt, HttpSttConfig, HttpTts, HttpTtsConfig};
pub use sentence::{SentenceSplitter, SentenceSplitterConfig};
pub use silence::SilenceFilter;
pub use stt::SttStage;
pub use tts::TtsStage;
pub use turn::TurnAggregator;
pub use vad::VadStage;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stage error: {0}")]
    Stage(String),

    #[error("pipeline not started")]
    NotStarted,

    #[error(transparent)]
    Core(#[from] corvid_core::CoreError),
}
