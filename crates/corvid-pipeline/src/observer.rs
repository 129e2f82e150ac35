//! Observer substrate.
//!
//! Observers are passive subscribers to the chain's broadcast bus. They
//! publish to the data channel, the metrics store, the memory backend, or
//! the robot's eye state — never back into the graph. A lagged subscriber
//! drops the oldest frames; the loss is counted as a drop metric.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use corvid_config::{MemoryConfig, ObserverConfig};
use corvid_core::{Frame, MemoryBackend, MetricEvent, MetricKind};
use corvid_tools::EyeStateSync;
use corvid_transport::{PeerMessage, TtsState};

use crate::metrics::MetricsStore;

/// Where observers publish peer-visible messages. The server implements
/// this over the transport's data channel.
#[async_trait]
pub trait PeerSink: Send + Sync {
    async fn send(&self, message: PeerMessage);
}

/// Everything the observer set needs for one session.
pub struct ObserverDeps {
    pub sink: Arc<dyn PeerSink>,
    pub metrics: Arc<MetricsStore>,
    pub observer_config: ObserverConfig,
    pub memory_config: MemoryConfig,
    /// Present when assistant replies should be stored.
    pub memory: Option<Arc<dyn MemoryBackend>>,
    pub user_id: String,
    /// Present when a robot is attached.
    pub eye_sync: Option<EyeStateSync>,
}

/// Spawn the observer set against a chain's bus.
pub fn spawn_observers(
    bus: &broadcast::Sender<Frame>,
    deps: ObserverDeps,
    cancel: CancellationToken,
) {
    spawn_transcript_observer(
        bus.subscribe(),
        deps.sink.clone(),
        deps.metrics.clone(),
        deps.observer_config.clone(),
        cancel.clone(),
    );
    spawn_state_observer(
        bus.subscribe(),
        deps.sink.clone(),
        deps.eye_sync.clone(),
        cancel.clone(),
    );
    spawn_metrics_observer(
        bus.subscribe(),
        deps.sink.clone(),
        deps.metrics.clone(),
        deps.observer_config,
        cancel.clone(),
    );
    if let (Some(memory), true) = (deps.memory, deps.memory_config.store_assistant) {
        spawn_assistant_store_observer(bus.subscribe(), memory, deps.user_id, cancel);
    }
}

/// Forwards transcripts to the peer: interims as `partial` (optionally held
/// while TTS is active), finals as `transcription` exactly once per turn.
fn spawn_transcript_observer(
    mut bus: broadcast::Receiver<Frame>,
    sink: Arc<dyn PeerSink>,
    metrics: Arc<MetricsStore>,
    config: ObserverConfig,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tts_active = false;
        let mut held_partial: Option<(String, Option<String>)> = None;
        let mut last_final_turn: u64 = 0;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = bus.recv() => match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        metrics.record(&MetricEvent::drop_count("transcript_observer", n));
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match frame {
                Frame::SttInterim(transcript) => {
                    if tts_active && !config.forward_partials_during_tts {
                        held_partial = Some((transcript.text, transcript.speaker_id));
                    } else {
                        sink.send(PeerMessage::Partial {
                            text: transcript.text,
                            speaker_id: transcript.speaker_id,
                        })
                        .await;
                    }
                }
                Frame::UserSpeechStopped { .. } => {
                    if let Some((text, speaker_id)) = held_partial.take() {
                        sink.send(PeerMessage::Partial { text, speaker_id }).await;
                    }
                }
                Frame::SttFinal { transcript, turn_id } => {
                    if turn_id > last_final_turn {
                        last_final_turn = turn_id;
                        sink.send(PeerMessage::Transcription {
                            text: transcript.text,
                            speaker_id: transcript.speaker_id,
                        })
                        .await;
                    }
                }
                Frame::TtsStarted { .. } => tts_active = true,
                Frame::TtsStopped { .. } => tts_active = false,
                _ => {}
            }
        }
    });
}

/// TTS start/stop to the peer, gate suppressions as `system` notes, errors
/// as structured `error` messages, and the robot eye state in lockstep.
fn spawn_state_observer(
    mut bus: broadcast::Receiver<Frame>,
    sink: Arc<dyn PeerSink>,
    eye_sync: Option<EyeStateSync>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut speaking = false;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = bus.recv() => match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match frame {
                Frame::TtsStarted { .. } => {
                    if !speaking {
                        speaking = true;
                        sink.send(PeerMessage::TtsState {
                            state: TtsState::Started,
                        })
                        .await;
                        if let Some(eyes) = &eye_sync {
                            eyes.set("speaking").await;
                        }
                    }
                }
                Frame::TtsStopped { .. } => {
                    if speaking {
                        speaking = false;
                        sink.send(PeerMessage::TtsState {
                            state: TtsState::Stopped,
                        })
                        .await;
                        if let Some(eyes) = &eye_sync {
                            eyes.set("idle").await;
                        }
                    }
                }
                Frame::UserSpeechStarted => {
                    if let Some(eyes) = &eye_sync {
                        eyes.set("listening").await;
                    }
                }
                Frame::SttFinal { .. } => {
                    if let Some(eyes) = &eye_sync {
                        eyes.set("thinking").await;
                    }
                }
                Frame::Metric(metric) if metric.kind == MetricKind::GateSuppress => {
                    sink.send(PeerMessage::System {
                        message: "Response suppressed: utterance not addressed to the assistant"
                            .to_string(),
                    })
                    .await;
                }
                Frame::Error { kind, detail, .. } => {
                    sink.send(PeerMessage::Error {
                        code: kind.as_str().to_string(),
                        message: detail,
                    })
                    .await;
                }
                _ => {}
            }
        }
    });
}

/// Records metrics and publishes debounced snapshots, at most one per
/// configured interval, skipping unchanged snapshots.
fn spawn_metrics_observer(
    mut bus: broadcast::Receiver<Frame>,
    sink: Arc<dyn PeerSink>,
    metrics: Arc<MetricsStore>,
    config: ObserverConfig,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let debounce = Duration::from_millis(config.snapshot_ms);
        let mut last_publish: Option<Instant> = None;
        let mut last_sent: Option<PeerMessage> = None;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = bus.recv() => match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        metrics.record(&MetricEvent::drop_count("metrics_observer", n));
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let snapshot_turn = match &frame {
                Frame::Metric(metric) => {
                    metrics.record(metric);
                    metric.turn_id
                }
                // Turn end always flushes a final snapshot.
                Frame::TtsStopped { turn_id } => Some(*turn_id),
                _ => None,
            };

            let Some(turn_id) = snapshot_turn else {
                continue;
            };

            let turn_ended = matches!(frame, Frame::TtsStopped { .. });
            let due = last_publish
                .map(|t| t.elapsed() >= debounce)
                .unwrap_or(true);
            if !due && !turn_ended {
                continue;
            }

            if let Some(snapshot) = metrics.snapshot(turn_id) {
                if last_sent.as_ref() != Some(&snapshot) {
                    sink.send(snapshot.clone()).await;
                    last_sent = Some(snapshot);
                    last_publish = Some(Instant::now());
                }
            }
        }
    });
}

/// Stores assistant replies into long-term memory, once per turn.
fn spawn_assistant_store_observer(
    mut bus: broadcast::Receiver<Frame>,
    memory: Arc<dyn MemoryBackend>,
    user_id: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut last_stored_turn: u64 = 0;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = bus.recv() => match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if let Frame::AssistantFinal { text, turn_id } = frame {
                if turn_id > last_stored_turn && !text.trim().is_empty() {
                    last_stored_turn = turn_id;
                    if let Err(e) = memory.store(&user_id, &text).await {
                        tracing::debug!(error = %e, "assistant memory store failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::Transcript;
    use parking_lot::Mutex;

    struct RecordingSink {
        messages: Mutex<Vec<PeerMessage>>,
    }

    #[async_trait]
    impl PeerSink for RecordingSink {
        async fn send(&self, message: PeerMessage) {
            self.messages.lock().push(message);
        }
    }

    fn deps(sink: Arc<RecordingSink>, metrics: Arc<MetricsStore>) -> ObserverDeps {
        ObserverDeps {
            sink,
            metrics,
            observer_config: ObserverConfig::default(),
            memory_config: MemoryConfig::default(),
            memory: None,
            user_id: "u1".into(),
            eye_sync: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_final_transcript_forwarded_once() {
        let (bus, _keep) = broadcast::channel::<Frame>(64);
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsStore::new());
        spawn_observers(&bus, deps(sink.clone(), metrics), CancellationToken::new());

        let frame = Frame::SttFinal {
            transcript: Transcript::new("what time is it in Tokyo?"),
            turn_id: 1,
        };
        // Multiple stages forward the same final; the bus sees each copy.
        bus.send(frame.clone()).unwrap();
        bus.send(frame.clone()).unwrap();
        bus.send(frame).unwrap();
        settle().await;

        let transcriptions = sink
            .messages
            .lock()
            .iter()
            .filter(|m| matches!(m, PeerMessage::Transcription { .. }))
            .count();
        assert_eq!(transcriptions, 1);
    }

    #[tokio::test]
    async fn test_partials_held_while_tts_active() {
        let (bus, _keep) = broadcast::channel::<Frame>(64);
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsStore::new());
        spawn_observers(&bus, deps(sink.clone(), metrics), CancellationToken::new());

        bus.send(Frame::TtsStarted { turn_id: 1 }).unwrap();
        settle().await;
        bus.send(Frame::SttInterim(Transcript::new("hold this")))
            .unwrap();
        settle().await;

        assert!(!sink
            .messages
            .lock()
            .iter()
            .any(|m| matches!(m, PeerMessage::Partial { .. })));

        // Flushed after the user stops speaking.
        bus.send(Frame::UserSpeechStopped { duration_ms: 500 })
            .unwrap();
        settle().await;
        assert!(sink
            .messages
            .lock()
            .iter()
            .any(|m| matches!(m, PeerMessage::Partial { text, .. } if text == "hold this")));
    }

    #[tokio::test]
    async fn test_gate_suppress_becomes_system_note() {
        let (bus, _keep) = broadcast::channel::<Frame>(64);
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsStore::new());
        spawn_observers(
            &bus,
            deps(sink.clone(), metrics.clone()),
            CancellationToken::new(),
        );

        bus.send(Frame::Metric(Arc::new(MetricEvent::marker(
            "gate",
            MetricKind::GateSuppress,
            2,
        ))))
        .unwrap();
        settle().await;

        assert!(sink
            .messages
            .lock()
            .iter()
            .any(|m| matches!(m, PeerMessage::System { .. })));
        assert_eq!(metrics.gate_suppressions(), 1);
    }

    #[tokio::test]
    async fn test_tts_state_messages_dedup() {
        let (bus, _keep) = broadcast::channel::<Frame>(64);
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsStore::new());
        spawn_observers(&bus, deps(sink.clone(), metrics), CancellationToken::new());

        bus.send(Frame::TtsStarted { turn_id: 1 }).unwrap();
        bus.send(Frame::TtsStarted { turn_id: 1 }).unwrap();
        bus.send(Frame::TtsStopped { turn_id: 1 }).unwrap();
        settle().await;

        let states: Vec<TtsState> = sink
            .messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                PeerMessage::TtsState { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![TtsState::Started, TtsState::Stopped]);
    }

    #[tokio::test]
    async fn test_metrics_snapshot_published_on_turn_end() {
        let (bus, _keep) = broadcast::channel::<Frame>(64);
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsStore::new());
        spawn_observers(&bus, deps(sink.clone(), metrics), CancellationToken::new());

        bus.send(Frame::Metric(Arc::new(MetricEvent::latency(
            "stt",
            MetricKind::SttTtfb,
            210.0,
            1,
        ))))
        .unwrap();
        bus.send(Frame::Metric(Arc::new(MetricEvent::latency(
            "llm",
            MetricKind::LlmTtfb,
            120.0,
            1,
        ))))
        .unwrap();
        bus.send(Frame::Metric(Arc::new(MetricEvent::latency(
            "tts",
            MetricKind::TtsTtfb,
            80.0,
            1,
        ))))
        .unwrap();
        bus.send(Frame::TtsStopped { turn_id: 1 }).unwrap();
        settle().await;

        let lock = sink.messages.lock();
        let snapshot = lock
            .iter()
            .find(|m| matches!(m, PeerMessage::Metrics { .. }))
            .expect("snapshot published");
        if let PeerMessage::Metrics {
            turn_id,
            llm_ttfb_ms,
            total_ms,
            ..
        } = snapshot
        {
            assert_eq!(*turn_id, 1);
            assert_eq!(*llm_ttfb_ms, Some(120.0));
            assert_eq!(*total_ms, Some(410.0));
        }
    }

    #[tokio::test]
    async fn test_error_frame_surfaces_to_peer() {
        let (bus, _keep) = broadcast::channel::<Frame>(64);
        let sink = Arc::new(RecordingSink {
            messages: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsStore::new());
        spawn_observers(&bus, deps(sink.clone(), metrics), CancellationToken::new());

        bus.send(Frame::Error {
            stage: "stt".into(),
            kind: corvid_core::ErrorKind::ProviderUnavailable,
            detail: "stt 503".into(),
        })
        .unwrap();
        settle().await;

        assert!(sink.messages.lock().iter().any(|m| matches!(
            m,
            PeerMessage::Error { code, .. } if code == "provider_unavailable"
        )));
    }
}
