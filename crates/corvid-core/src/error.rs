//! Error types shared across the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Recovery-policy classification carried on error frames and in the
/// data-channel `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry with backoff, bounded per stage.
    TransientNetwork,
    /// Abort the current turn, keep the session alive.
    ProviderUnavailable,
    /// Surface to the peer, no retry.
    BadInput,
    /// e.g. no common codec after negotiation. Surface, no retry.
    PolicyViolation,
    /// Stage-specific fallback: gate fails open, memory returns empty,
    /// STT reconnects, tool calls error back to the LLM.
    DeadlineExceeded,
    /// End the session with a final error message.
    InternalInvariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::InternalInvariant => "internal_invariant",
        }
    }

    /// Whether a stage may retry in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork)
    }
}

/// Errors produced by providers and pipeline stages.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("network error: {0}")]
    Network(String),

    #[error("provider unavailable: {0}")]
    Provider(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("deadline exceeded: {0}")]
    Deadline(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Network(_) => ErrorKind::TransientNetwork,
            CoreError::Provider(_) => ErrorKind::ProviderUnavailable,
            CoreError::BadInput(_) => ErrorKind::BadInput,
            CoreError::Policy(_) => ErrorKind::PolicyViolation,
            CoreError::Deadline(_) => ErrorKind::DeadlineExceeded,
            // Cancellation is normal turn termination, not an invariant break,
            // but it never crosses a stage boundary as an error frame.
            CoreError::Cancelled => ErrorKind::DeadlineExceeded,
            CoreError::Invariant(_) => ErrorKind::InternalInvariant,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
