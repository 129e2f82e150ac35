//! Centralized timing constants.
//!
//! Every deadline and budget in the system is defined here and surfaced as a
//! `Settings` default, so a tuned deployment overrides configuration rather
//! than hunting for magic numbers.

/// Voice-activity detection.
pub mod vad {
    /// Minimum silence after speech before `UserSpeechStopped` fires.
    pub const SILENCE_HANGOVER_MS: u64 = 600;
    /// Energy floor below which a frame is never speech.
    pub const ENERGY_FLOOR_DB: f32 = -45.0;
    /// Speech must persist this long before `UserSpeechStarted` fires.
    pub const MIN_SPEECH_MS: u64 = 100;
    /// Audio arrives in 20ms chunks.
    pub const FRAME_MS: u64 = 20;
}

/// Turn aggregation.
pub mod turn {
    /// Latest interim must be unchanged this long before the final is cut.
    pub const STABILISE_MS: u64 = 300;
    /// Hard deadline after speech-stop regardless of interim churn.
    pub const HARD_DEADLINE_MS: u64 = 1_500;
    /// LLM and TTS must wind down within this budget after an interrupt.
    pub const ABORT_GRACE_MS: u64 = 200;
}

/// Speech-to-text adapter.
pub mod stt {
    /// First interim must arrive within this budget after speech onset.
    pub const FIRST_INTERIM_BUDGET_MS: u64 = 1_500;
    /// Retry budget for transient provider failures.
    pub const MAX_RETRIES: u32 = 2;
    pub const INITIAL_BACKOFF_MS: u64 = 250;
}

/// Reply gate.
pub mod gate {
    pub const CLASSIFY_BUDGET_MS: u64 = 400;
    /// Turns of context handed to the classifier.
    pub const HISTORY_TURNS: usize = 4;
}

/// Memory interface.
pub mod memory {
    pub const RECALL_BUDGET_MS: u64 = 50;
    pub const RECALL_K: usize = 5;
    /// Weight of the vector score in the hybrid fusion; the keyword score
    /// gets the remainder.
    pub const VECTOR_WEIGHT: f32 = 0.7;
}

/// Hardware control.
pub mod robot {
    /// Unary command deadline (movement, emotion, eye state, status).
    pub const COMMAND_TIMEOUT_MS: u64 = 300;
    /// Camera capture deadline.
    pub const CAPTURE_TIMEOUT_MS: u64 = 1_000;
}

/// Observer substrate.
pub mod observer {
    /// Metrics snapshots publish at most once per this interval.
    pub const SNAPSHOT_DEBOUNCE_MS: u64 = 500;
    /// Sliding window for aggregate latency stats.
    pub const WINDOW_TURNS: usize = 100;
    /// Per-turn table length.
    pub const TABLE_TURNS: usize = 20;
}

/// Transport.
pub mod transport {
    /// A `failed` peer connection closes the session after this grace.
    pub const FAILED_CLOSE_GRACE_MS: u64 = 5_000;
    pub const ICE_DISCONNECTED_TIMEOUT_SECS: u64 = 5;
    pub const ICE_FAILED_TIMEOUT_SECS: u64 = 25;
    pub const ICE_KEEPALIVE_INTERVAL_SECS: u64 = 2;
    /// Outbound packet time.
    pub const PTIME_MS: u64 = 20;
}

/// Queue capacities per edge class.
pub mod queues {
    /// ~160ms of audio at 20ms chunks; the producer blocks on overflow.
    pub const AUDIO_EDGE: usize = 8;
    /// Control edges hold a single frame.
    pub const CONTROL_EDGE: usize = 1;
    /// Text edges between stages.
    pub const TEXT_EDGE: usize = 64;
    /// Observer fan-out; lagged receivers drop oldest and count a drop.
    pub const OBSERVER_BUS: usize = 256;
}

/// LLM adapter.
pub mod llm {
    pub const MAX_TOKENS: u32 = 512;
    pub const TEMPERATURE: f32 = 0.7;
    pub const CONTEXT_TOKEN_BUDGET: usize = 8_192;
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const MAX_RETRIES: u32 = 2;
    pub const INITIAL_BACKOFF_MS: u64 = 100;
}

/// Sentence splitting for TTS framing.
pub mod sentence {
    /// First unit may be cut early at this many chars for latency.
    pub const MIN_FIRST_UNIT_CHARS: usize = 15;
    /// Force a cut at a word boundary past this many buffered chars.
    pub const MAX_BUFFER_CHARS: usize = 400;
}
