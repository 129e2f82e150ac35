//! Turn lifecycle control shared across stages.
//!
//! Turn ids are allocated monotonically when the aggregator cuts a final.
//! Each turn owns a cancellation token handed to the LLM and TTS stages;
//! interrupting a turn cancels the token exactly once, making redelivered
//! `Interrupt` frames no-ops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// A live turn: its id and the token scoping its in-flight work.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub turn_id: u64,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct TurnEntry {
    cancel: CancellationToken,
    interrupted: bool,
}

/// Shared turn state for one session.
#[derive(Default)]
pub struct TurnControl {
    next_turn: AtomicU64,
    turns: Mutex<HashMap<u64, TurnEntry>>,
    /// True between a gate pass and the matching `TtsStopped`.
    assistant_active: AtomicBool,
}

impl TurnControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next turn. Ids start at 1 and only increase.
    pub fn begin_turn(&self) -> TurnHandle {
        let turn_id = self.next_turn.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        self.turns.lock().insert(
            turn_id,
            TurnEntry {
                cancel: cancel.clone(),
                interrupted: false,
            },
        );
        TurnHandle { turn_id, cancel }
    }

    pub fn current_turn(&self) -> u64 {
        self.next_turn.load(Ordering::SeqCst)
    }

    pub fn token(&self, turn_id: u64) -> Option<CancellationToken> {
        self.turns.lock().get(&turn_id).map(|e| e.cancel.clone())
    }

    /// Interrupt a turn. Returns true only on the first delivery; the token
    /// is cancelled then and redelivery has no further effect.
    pub fn interrupt(&self, turn_id: u64) -> bool {
        let mut turns = self.turns.lock();
        match turns.get_mut(&turn_id) {
            Some(entry) if !entry.interrupted => {
                entry.interrupted = true;
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_interrupted(&self, turn_id: u64) -> bool {
        self.turns
            .lock()
            .get(&turn_id)
            .map(|e| e.interrupted)
            .unwrap_or(false)
    }

    /// Drop bookkeeping for a finished turn.
    pub fn end_turn(&self, turn_id: u64) {
        self.turns.lock().remove(&turn_id);
    }

    pub fn set_assistant_active(&self, active: bool) {
        self.assistant_active.store(active, Ordering::SeqCst);
    }

    pub fn assistant_active(&self) -> bool {
        self.assistant_active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_ids_monotonic() {
        let control = TurnControl::new();
        let a = control.begin_turn();
        let b = control.begin_turn();
        assert_eq!(a.turn_id, 1);
        assert_eq!(b.turn_id, 2);
        assert_eq!(control.current_turn(), 2);
    }

    #[test]
    fn test_interrupt_idempotent() {
        let control = TurnControl::new();
        let turn = control.begin_turn();

        assert!(control.interrupt(turn.turn_id));
        assert!(turn.cancel.is_cancelled());
        // Redelivery has no effect.
        assert!(!control.interrupt(turn.turn_id));
        assert!(control.is_interrupted(turn.turn_id));
    }

    #[test]
    fn test_interrupt_unknown_turn() {
        let control = TurnControl::new();
        assert!(!control.interrupt(42));
        assert!(!control.is_interrupted(42));
    }

    #[test]
    fn test_end_turn_clears_state() {
        let control = TurnControl::new();
        let turn = control.begin_turn();
        control.end_turn(turn.turn_id);
        assert!(control.token(turn.turn_id).is_none());
    }

    #[test]
    fn test_assistant_active_flag() {
        let control = TurnControl::new();
        assert!(!control.assistant_active());
        control.set_assistant_active(true);
        assert!(control.assistant_active());
    }
}
