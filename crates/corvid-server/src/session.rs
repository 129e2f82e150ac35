//! Per-peer sessions.
//!
//! A session owns the transport, the pipeline graph, and the bridging tasks
//! between them. Closing the session cancels the pipeline scope, which stops
//! every stage task and in-flight provider call.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock as AsyncRwLock};

use corvid_core::{AudioFrame, Frame, SampleRate};
use corvid_pipeline::{PeerSink, PipelineHandle};
use corvid_transport::{PeerMessage, TransportEvent, WebRtcTransport};

use crate::ServerError;

/// Publishes observer messages onto the peer's data channel.
pub struct DataChannelSink {
    transport: Arc<AsyncRwLock<WebRtcTransport>>,
}

impl DataChannelSink {
    pub fn new(transport: Arc<AsyncRwLock<WebRtcTransport>>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PeerSink for DataChannelSink {
    async fn send(&self, message: PeerMessage) {
        if let Err(e) = self.transport.read().await.send_message(&message).await {
            tracing::debug!(error = %e, "data channel send failed");
        }
    }
}

pub struct Session {
    pub id: String,
    pub transport: Arc<AsyncRwLock<WebRtcTransport>>,
    pipeline: PipelineHandle,
    pub created_at: Instant,
    last_activity: RwLock<Instant>,
    active: RwLock<bool>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<AsyncRwLock<WebRtcTransport>>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            id: id.into(),
            transport,
            pipeline,
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            active: RwLock::new(true),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    pub fn is_active(&self) -> bool {
        *self.active.read()
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    /// Tear down: cancel the pipeline scope and close the peer connection.
    pub async fn close(&self) {
        if !*self.active.read() {
            return;
        }
        *self.active.write() = false;
        self.pipeline.shutdown();
        if let Err(e) = self.transport.write().await.close().await {
            tracing::debug!(session_id = %self.id, error = %e, "transport close");
        }
        tracing::info!(session_id = %self.id, "session closed");
    }

    /// Wire the transport to the pipeline:
    /// - inbound audio, resampled to the canonical STT rate
    /// - outbound `AudioOutput` frames to the peer
    /// - transport lifecycle events to session teardown
    pub fn spawn_bridges(self: &Arc<Self>, output: tokio::sync::mpsc::Receiver<Frame>) {
        let cancel = self.pipeline.cancellation_token();

        // Peer audio → pipeline.
        let session = Arc::clone(self);
        let input = self.pipeline.input.clone();
        let bridge_cancel = cancel.clone();
        tokio::spawn(async move {
            let audio_rx = session.transport.read().await.take_audio_rx();
            let Some(mut audio_rx) = audio_rx else {
                tracing::warn!(session_id = %session.id, "audio receiver already taken");
                return;
            };

            loop {
                let frame = tokio::select! {
                    _ = bridge_cancel.cancelled() => break,
                    frame = audio_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                session.touch();

                let frame: AudioFrame = frame.resample(SampleRate::Hz16000);
                // Blocking send: audio ingress backpressures rather than drops.
                if input.send(Frame::AudioInput(frame)).await.is_err() {
                    break;
                }
            }
            tracing::debug!(session_id = %session.id, "audio-in bridge ended");
        });

        // Pipeline → peer audio.
        let session = Arc::clone(self);
        let out_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut output = output;
            loop {
                let frame = tokio::select! {
                    _ = out_cancel.cancelled() => break,
                    frame = output.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                match frame {
                    Frame::AudioOutput(audio) => {
                        let transport = session.transport.read().await;
                        if let Err(e) = transport.send_audio(&audio).await {
                            tracing::debug!(error = %e, "audio send failed");
                        }
                    }
                    Frame::TtsStopped { .. } => {
                        let transport = session.transport.read().await;
                        let _ = transport.flush_audio().await;
                    }
                    _ => {}
                }
            }
            tracing::debug!(session_id = %session.id, "audio-out bridge ended");
        });

        // Transport lifecycle → session teardown.
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let event_rx = session.transport.read().await.take_event_rx();
            let Some(mut event_rx) = event_rx else {
                return;
            };

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    TransportEvent::Connected => {
                        tracing::info!(session_id = %session.id, "peer connected");
                        session.touch();
                    }
                    TransportEvent::Closed { reason } => {
                        tracing::info!(session_id = %session.id, reason = %reason, "peer gone");
                        session.close().await;
                        break;
                    }
                    TransportEvent::DataMessage(text) => {
                        tracing::debug!(session_id = %session.id, text = %text, "peer message");
                    }
                }
            }
        });
    }
}

/// All live sessions, capacity-capped, with periodic expiry sweep.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    session_timeout: Duration,
    cleanup_interval: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            session_timeout: Duration::from_secs(3_600),
            cleanup_interval: Duration::from_secs(300),
        }
    }

    /// Reserve a slot; fails when at capacity even after sweeping.
    pub fn check_capacity(&self) -> Result<(), ServerError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(self.session_timeout) || !s.is_active())
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                sessions.remove(&id);
            }
            if sessions.len() >= self.max_sessions {
                return Err(ServerError::Capacity);
            }
        }
        Ok(())
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub async fn remove(&self, id: &str) {
        let session = self.sessions.write().remove(id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Background sweep of expired or dead sessions. Returns the shutdown
    /// handle for the sweep task.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = manager.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stale: Vec<Arc<Session>> = {
                            let sessions = manager.sessions.read();
                            sessions
                                .values()
                                .filter(|s| s.is_expired(manager.session_timeout) || !s.is_active())
                                .cloned()
                                .collect()
                        };
                        for session in stale {
                            tracing::info!(session_id = %session.id, "sweeping session");
                            manager.remove(&session.id).await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_check() {
        let manager = SessionManager::new(0);
        assert!(matches!(
            manager.check_capacity(),
            Err(ServerError::Capacity)
        ));

        let manager = SessionManager::new(4);
        assert!(manager.check_capacity().is_ok());
        assert_eq!(manager.count(), 0);
    }
}
