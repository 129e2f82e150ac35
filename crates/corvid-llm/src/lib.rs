//! LLM adapters for corvid.
//!
//! - [`OpenAiChatBackend`]: streaming chat-completions client with native
//!   tool-call deltas, retry with backoff for transient failures, and prompt
//!   cancellation scoped to the turn.
//! - [`ReplyGate`]: the fast traffic-controller classifier deciding whether
//!   an utterance is addressed to the assistant.

mod backend;
mod gate;
mod vision;

pub use backend::{OpenAiChatBackend, OpenAiChatConfig};
pub use gate::{ReplyGate, ReplyGateConfig};
pub use vision::{VisionBackend, VisionBackendConfig};
