//! Expression mapping and rate limiting.
//!
//! The `express` tool resolves an (emotion, intensity) pair to a hardware eye
//! state plus an optional gesture sequence. The rate limiter keeps the LLM
//! from wearing out servos: gestures have cooldowns and per-session caps, and
//! an over-budget expression downgrades to eyes-only instead of failing.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Emotions the LLM may use: hardware-native states plus semantic aliases.
pub const VALID_EMOTIONS: &[&str] = &[
    "neutral",
    "happy",
    "sad",
    "angry",
    "excited",
    "afraid",
    "sleepy",
    "greeting",
    "farewell",
    "celebration",
    "apologetic",
];

pub const VALID_INTENSITIES: &[&str] = &["low", "medium", "high"];

/// Resolved hardware actions for one expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub eyes: &'static str,
    pub gesture: Option<&'static str>,
}

/// Aliases resolve to a default eye state when no map entry matches.
fn alias_eyes(emotion: &str) -> &'static str {
    match emotion {
        "greeting" | "farewell" => "happy",
        "celebration" => "excited",
        "apologetic" => "sad",
        "happy" => "happy",
        "sad" => "sad",
        "angry" => "angry",
        "excited" => "excited",
        "afraid" => "afraid",
        "sleepy" => "sleepy",
        _ => "neutral",
    }
}

/// Sparse map: only pairs that trigger a gesture. Everything else is
/// eyes-only.
pub fn resolve(emotion: &str, intensity: &str) -> Expression {
    let gesture = match (emotion, intensity) {
        ("happy", "high") => Some("side_side"),
        ("sad", "high") => Some("bow"),
        ("angry", "high") => Some("side_side"),
        ("excited", "medium") => Some("side_side"),
        ("excited", "high") => Some("excited"),
        ("afraid", "high") => Some("side_side"),
        ("greeting", "high") => Some("wave_right"),
        ("farewell", "high") => Some("bow"),
        ("celebration", "medium") => Some("side_side"),
        ("celebration", "high") => Some("excited"),
        ("apologetic", "high") => Some("bow"),
        _ => None,
    };
    Expression {
        eyes: alias_eyes(emotion),
        gesture,
    }
}

/// Gesture name → movement sequence for the hardware daemon.
pub fn gesture_movements(gesture: &str) -> Vec<String> {
    let movements: &[&str] = match gesture {
        "bow" => &["bow"],
        "side_side" => &["tilt_left", "tilt_right"],
        "wave_right" => &["wave_right"],
        "excited" => &["tilt_left", "tilt_right", "tilt_left", "tilt_right"],
        other => return vec![other.to_string()],
    };
    movements.iter().map(|m| m.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub min_expression_interval: Duration,
    pub min_gesture_interval: Duration,
    pub max_medium_per_session: u32,
    pub max_high_per_session: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_expression_interval: Duration::from_secs(2),
            min_gesture_interval: Duration::from_secs(15),
            max_medium_per_session: 5,
            max_high_per_session: 2,
        }
    }
}

#[derive(Default)]
struct LimiterState {
    last_expression: Option<Instant>,
    last_gesture: Option<Instant>,
    medium_count: u32,
    high_count: u32,
}

/// Per-session expression budget.
pub struct ExpressionRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl ExpressionRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Whether an expression at `intensity` may run now. Returns the denial
    /// reason otherwise; callers downgrade to "low" rather than dropping the
    /// expression entirely.
    pub fn check(&self, intensity: &str) -> Result<(), &'static str> {
        let state = self.state.lock();
        let now = Instant::now();

        if let Some(last) = state.last_expression {
            if now.duration_since(last) < self.config.min_expression_interval {
                return Err("too soon after last expression");
            }
        }

        match intensity {
            "low" => Ok(()),
            "medium" => {
                if let Some(last) = state.last_gesture {
                    if now.duration_since(last) < self.config.min_gesture_interval {
                        return Err("gesture on cooldown");
                    }
                }
                if state.medium_count >= self.config.max_medium_per_session {
                    return Err("medium intensity session limit reached");
                }
                Ok(())
            }
            "high" => {
                if let Some(last) = state.last_gesture {
                    if now.duration_since(last) < self.config.min_gesture_interval * 2 {
                        return Err("gesture on cooldown for high intensity");
                    }
                }
                if state.high_count >= self.config.max_high_per_session {
                    return Err("high intensity session limit reached");
                }
                Ok(())
            }
            _ => Err("unknown intensity"),
        }
    }

    pub fn record(&self, intensity: &str, had_gesture: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.last_expression = Some(now);
        if had_gesture {
            state.last_gesture = Some(now);
        }
        match intensity {
            "medium" => state.medium_count += 1,
            "high" => state.high_count += 1,
            _ => {}
        }
    }
}
