//! Streaming STT stage.
//!
//! Drives the provider's bidirectional stream: audio chunks in, interim and
//! final hypotheses out. Events are polled opportunistically on every audio
//! tick, so transcripts surface within one chunk interval of the provider
//! producing them.
//!
//! Failure handling: transient errors reconnect with exponential backoff up
//! to the per-stage budget, then surface a `provider_unavailable` error and
//! go dormant until the next speech onset. The audio path itself never
//! retries in-band.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use corvid_config::SttProviderConfig;
use corvid_core::{
    CoreError, Frame, FrameProcessor, FrameSender, ProcessorContext, Result, SpeechToText,
    SttEvent, SttSession,
};

use corvid_config::constants::stt as stt_constants;

/// Poll window for pending provider events on each audio tick.
const EVENT_POLL: Duration = Duration::from_millis(1);

struct SttState {
    session: Option<Box<dyn SttSession>>,
    /// Set at speech onset, cleared by the first interim.
    awaiting_first_interim: Option<Instant>,
    /// Attempts consumed in the current failure episode.
    attempts: u32,
    /// Down until the next speech onset.
    dormant: bool,
    /// One provider final already surfaced for the current VAD turn.
    final_seen: bool,
}

pub struct SttStage {
    provider: std::sync::Arc<dyn SpeechToText>,
    config: SttProviderConfig,
    state: Mutex<SttState>,
}

impl SttStage {
    pub fn new(provider: std::sync::Arc<dyn SpeechToText>, config: SttProviderConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(SttState {
                session: None,
                awaiting_first_interim: None,
                attempts: 0,
                dormant: false,
                final_seen: false,
            }),
        }
    }

    async fn connect(&self, state: &mut SttState) -> Result<()> {
        let mut backoff = Duration::from_millis(stt_constants::INITIAL_BACKOFF_MS);
        loop {
            match self.provider.open().await {
                Ok(session) => {
                    state.session = Some(session);
                    state.attempts = 0;
                    tracing::info!(provider = self.provider.provider_name(), "stt stream open");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && state.attempts < stt_constants::MAX_RETRIES => {
                    state.attempts += 1;
                    tracing::warn!(
                        attempt = state.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "stt connect failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    state.attempts = 0;
                    state.dormant = true;
                    return Err(match e {
                        CoreError::Network(detail) => CoreError::Provider(detail),
                        other => other,
                    });
                }
            }
        }
    }

    /// Providers label the primary speaker "S1"; the rest of the system
    /// (gate, data channel) speaks in session guest ids.
    fn remap_speaker(transcript: &mut corvid_core::Transcript, user_id: &str) {
        if transcript.speaker_id.as_deref() == Some("S1") && !user_id.is_empty() {
            transcript.speaker_id = Some(user_id.to_string());
        }
    }

    /// Drain whatever events the provider has ready.
    async fn poll_events(
        &self,
        state: &mut SttState,
        user_id: &str,
        out: &FrameSender,
    ) -> Result<()> {
        let Some(mut session) = state.session.take() else {
            return Ok(());
        };

        loop {
            let event = match tokio::time::timeout(EVENT_POLL, session.next_event()).await {
                Ok(Ok(Some(event))) => event,
                Ok(Ok(None)) => {
                    // Provider closed the stream mid-utterance.
                    return Err(CoreError::Network("stt stream closed".into()));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // Nothing pending; the stream stays up.
                    state.session = Some(session);
                    return Ok(());
                }
            };

            match event {
                SttEvent::Interim(mut transcript) => {
                    state.awaiting_first_interim = None;
                    Self::remap_speaker(&mut transcript, user_id);
                    out.send(Frame::SttInterim(transcript)).await.ok();
                }
                SttEvent::Final(mut transcript) => {
                    // At most one provider final per VAD turn; the aggregator
                    // treats it as the definitive last hypothesis.
                    if !state.final_seen {
                        state.final_seen = true;
                        state.awaiting_first_interim = None;
                        Self::remap_speaker(&mut transcript, user_id);
                        out.send(Frame::SttInterim(transcript)).await.ok();
                    }
                }
            }
        }
    }

    fn first_interim_overdue(&self, state: &SttState) -> bool {
        state
            .awaiting_first_interim
            .map(|since| since.elapsed() >= Duration::from_millis(self.config.first_interim_budget_ms))
            .unwrap_or(false)
    }

    async fn handle_onset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.dormant = false;
        state.final_seen = false;
        state.awaiting_first_interim = Some(Instant::now());
        if state.session.is_none() {
            self.connect(&mut state).await?;
        }
        Ok(())
    }

    async fn handle_audio(
        &self,
        audio: &corvid_core::AudioFrame,
        user_id: &str,
        out: &FrameSender,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.dormant {
            return Ok(());
        }

        // Interim deadline: tear the stream down and reconnect.
        if self.first_interim_overdue(&state) {
            tracing::warn!("stt first-interim budget exceeded, reconnecting");
            if let Some(mut session) = state.session.take() {
                let _ = session.close().await;
            }
            state.awaiting_first_interim = Some(Instant::now());
            self.connect(&mut state).await?;
        }

        if let Some(mut session) = state.session.take() {
            match session.send_audio(audio).await {
                Ok(()) => state.session = Some(session),
                Err(e) => {
                    tracing::warn!(error = %e, "stt send failed, reconnecting");
                    drop(session);
                    self.connect(&mut state).await?;
                }
            }
        }

        if let Err(e) = self.poll_events(&mut state, user_id, out).await {
            tracing::warn!(error = %e, "stt stream lost, reconnecting");
            self.connect(&mut state).await?;
        }
        Ok(())
    }

    async fn handle_stop(&self, user_id: &str, out: &FrameSender) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(mut session) = state.session.take() {
            match session.finalize().await {
                Ok(transcript) => {
                    state.session = Some(session);
                    if let Some(mut transcript) = transcript {
                        if !state.final_seen {
                            state.final_seen = true;
                            Self::remap_speaker(&mut transcript, user_id);
                            out.send(Frame::SttInterim(transcript)).await.ok();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stt finalize failed");
                }
            }
        }
        state.awaiting_first_interim = None;
        Ok(())
    }
}

#[async_trait]
impl FrameProcessor for SttStage {
    async fn process(
        &self,
        frame: Frame,
        ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        let work = match &frame {
            Frame::UserSpeechStarted => self.handle_onset().await,
            Frame::AudioInput(audio) => self.handle_audio(audio, &ctx.user_id, out).await,
            Frame::UserSpeechStopped { .. } => self.handle_stop(&ctx.user_id, out).await,
            _ => Ok(()),
        };

        // The incoming frame always continues downstream, even when the
        // provider is failing; the aggregator still needs the boundaries.
        out.send(frame).await.ok();
        work
    }

    fn name(&self) -> &'static str {
        "stt"
    }

    async fn on_stop(&self, _ctx: &mut ProcessorContext) -> Result<()> {
        if let Some(mut session) = self.state.lock().await.session.take() {
            let _ = session.close().await;
        }
        Ok(())
    }
}
