//! Per-turn metrics store.
//!
//! Keeps first-byte latencies per turn, a sliding aggregation window, and a
//! short per-turn table. An absent measurement stays absent; the store never
//! reports a fabricated zero.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use corvid_config::constants::observer::{TABLE_TURNS, WINDOW_TURNS};
use corvid_core::{MetricEvent, MetricKind};
use corvid_transport::PeerMessage;

/// First-byte latencies recorded for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnMetrics {
    pub turn_id: u64,
    pub stt_ttfb_ms: Option<f64>,
    pub recall_ms: Option<f64>,
    pub llm_ttfb_ms: Option<f64>,
    pub tts_ttfb_ms: Option<f64>,
}

impl TurnMetrics {
    /// End-to-end latency, defined only when every stage on the voice path
    /// reported its first byte. A missing stage leaves the total absent.
    pub fn total_ms(&self) -> Option<f64> {
        match (self.stt_ttfb_ms, self.llm_ttfb_ms, self.tts_ttfb_ms) {
            (Some(stt), Some(llm), Some(tts)) => Some(stt + llm + tts),
            _ => None,
        }
    }
}

/// last/avg/min/max over the sliding window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub last: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Default)]
pub struct MetricsStore {
    window: Mutex<VecDeque<TurnMetrics>>,
    gate_suppressions: AtomicU64,
    drops: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &MetricEvent) {
        match event.kind {
            MetricKind::GateSuppress => {
                self.gate_suppressions.fetch_add(1, Ordering::Relaxed);
            }
            MetricKind::Drop => {
                let count = event.value.unwrap_or(1.0) as u64;
                self.drops.fetch_add(count, Ordering::Relaxed);
            }
            kind => {
                let (Some(turn_id), Some(value)) = (event.turn_id, event.value) else {
                    return;
                };
                let mut window = self.window.lock();
                let entry = match window.iter_mut().find(|t| t.turn_id == turn_id) {
                    Some(entry) => entry,
                    None => {
                        window.push_back(TurnMetrics {
                            turn_id,
                            ..Default::default()
                        });
                        if window.len() > WINDOW_TURNS {
                            window.pop_front();
                        }
                        window.back_mut().expect("just pushed")
                    }
                };
                match kind {
                    MetricKind::SttTtfb => entry.stt_ttfb_ms = Some(value),
                    MetricKind::Recall => entry.recall_ms = Some(value),
                    MetricKind::LlmTtfb => entry.llm_ttfb_ms = Some(value),
                    MetricKind::TtsTtfb => entry.tts_ttfb_ms = Some(value),
                    MetricKind::TurnTotal | MetricKind::GateSuppress | MetricKind::Drop => {}
                }
            }
        }
    }

    pub fn turn(&self, turn_id: u64) -> Option<TurnMetrics> {
        self.window
            .lock()
            .iter()
            .find(|t| t.turn_id == turn_id)
            .cloned()
    }

    /// The most recent turns, newest last.
    pub fn table(&self) -> Vec<TurnMetrics> {
        let window = self.window.lock();
        window
            .iter()
            .rev()
            .take(TABLE_TURNS)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Aggregate one latency kind over the window. `None` when no turn in
    /// the window recorded it.
    pub fn aggregate(&self, kind: MetricKind) -> Option<Aggregate> {
        let window = self.window.lock();
        let values: Vec<f64> = window
            .iter()
            .filter_map(|t| match kind {
                MetricKind::SttTtfb => t.stt_ttfb_ms,
                MetricKind::Recall => t.recall_ms,
                MetricKind::LlmTtfb => t.llm_ttfb_ms,
                MetricKind::TtsTtfb => t.tts_ttfb_ms,
                MetricKind::TurnTotal => t.total_ms(),
                _ => None,
            })
            .collect();

        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Aggregate {
            last: *values.last().expect("non-empty"),
            avg: sum / values.len() as f64,
            min: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            count: values.len(),
        })
    }

    pub fn gate_suppressions(&self) -> u64 {
        self.gate_suppressions.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Data-channel snapshot for one turn; absent fields stay absent.
    pub fn snapshot(&self, turn_id: u64) -> Option<PeerMessage> {
        let turn = self.turn(turn_id)?;
        Some(PeerMessage::Metrics {
            turn_id,
            stt_ttfb_ms: turn.stt_ttfb_ms,
            recall_ms: turn.recall_ms,
            llm_ttfb_ms: turn.llm_ttfb_ms,
            tts_ttfb_ms: turn.tts_ttfb_ms,
            total_ms: turn.total_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(kind: MetricKind, value: f64, turn_id: u64) -> MetricEvent {
        MetricEvent::latency("test", kind, value, turn_id)
    }

    #[test]
    fn test_absent_metric_stays_absent() {
        let store = MetricsStore::new();
        store.record(&latency(MetricKind::LlmTtfb, 150.0, 1));

        let turn = store.turn(1).unwrap();
        assert_eq!(turn.llm_ttfb_ms, Some(150.0));
        assert_eq!(turn.stt_ttfb_ms, None);
        assert_eq!(turn.total_ms(), None);
    }

    #[test]
    fn test_total_requires_every_stage() {
        let store = MetricsStore::new();
        store.record(&latency(MetricKind::SttTtfb, 200.0, 1));
        store.record(&latency(MetricKind::LlmTtfb, 150.0, 1));
        store.record(&latency(MetricKind::TtsTtfb, 100.0, 1));

        let turn = store.turn(1).unwrap();
        assert_eq!(turn.total_ms(), Some(450.0));

        // A turn whose STT never reported (e.g. the greeting turn) has no
        // total; nothing is substituted for the missing stage.
        store.record(&latency(MetricKind::LlmTtfb, 150.0, 2));
        store.record(&latency(MetricKind::TtsTtfb, 100.0, 2));
        let turn = store.turn(2).unwrap();
        assert_eq!(turn.stt_ttfb_ms, None);
        assert_eq!(turn.total_ms(), None);
    }

    #[test]
    fn test_window_bounded() {
        let store = MetricsStore::new();
        for turn_id in 1..=(WINDOW_TURNS as u64 + 10) {
            store.record(&latency(MetricKind::LlmTtfb, 100.0, turn_id));
        }
        assert!(store.turn(1).is_none());
        assert!(store.turn(WINDOW_TURNS as u64 + 10).is_some());

        let agg = store.aggregate(MetricKind::LlmTtfb).unwrap();
        assert_eq!(agg.count, WINDOW_TURNS);
    }

    #[test]
    fn test_aggregate_values() {
        let store = MetricsStore::new();
        store.record(&latency(MetricKind::LlmTtfb, 100.0, 1));
        store.record(&latency(MetricKind::LlmTtfb, 300.0, 2));

        let agg = store.aggregate(MetricKind::LlmTtfb).unwrap();
        assert_eq!(agg.last, 300.0);
        assert_eq!(agg.avg, 200.0);
        assert_eq!(agg.min, 100.0);
        assert_eq!(agg.max, 300.0);
    }

    #[test]
    fn test_aggregate_none_when_kind_never_recorded() {
        let store = MetricsStore::new();
        store.record(&latency(MetricKind::LlmTtfb, 100.0, 1));
        assert!(store.aggregate(MetricKind::SttTtfb).is_none());
    }

    #[test]
    fn test_markers_counted() {
        let store = MetricsStore::new();
        store.record(&MetricEvent::marker("gate", MetricKind::GateSuppress, 3));
        store.record(&MetricEvent::drop_count("observer", 5));
        assert_eq!(store.gate_suppressions(), 1);
        assert_eq!(store.drops(), 5);
    }

    #[test]
    fn test_snapshot_shape() {
        let store = MetricsStore::new();
        store.record(&latency(MetricKind::LlmTtfb, 150.0, 7));

        let snapshot = store.snapshot(7).unwrap();
        match snapshot {
            PeerMessage::Metrics {
                turn_id,
                llm_ttfb_ms,
                stt_ttfb_ms,
                total_ms,
                ..
            } => {
                assert_eq!(turn_id, 7);
                assert_eq!(llm_ttfb_ms, Some(150.0));
                assert_eq!(stt_ttfb_ms, None);
                assert_eq!(total_ms, None);
            }
            _ => panic!("wrong message type"),
        }
        assert!(store.snapshot(99).is_none());
    }
}
