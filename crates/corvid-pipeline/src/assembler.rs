//! Pipeline assembly.
//!
//! Builds the per-session stage graph from configuration: providers, persona,
//! memory on/off, robot on/off. The graph is immutable for the life of the
//! session; reconfiguration means a new session.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use corvid_config::constants::queues;
use corvid_config::Settings;
use corvid_core::{
    Context, ControlFrame, Frame, GateClassifier, LanguageModel, MemoryBackend, ProcessorContext,
    SpeechToText, TextToSpeech,
};
use corvid_tools::{EyeStateSync, ToolRegistry};

use crate::chain::ProcessorChain;
use crate::control::TurnControl;
use crate::gate::GateStage;
use crate::llm::LlmStage;
use crate::memory::MemoryStage;
use crate::metrics::MetricsStore;
use crate::observer::{spawn_observers, ObserverDeps, PeerSink};
use crate::sentence::{SentenceSplitter, SentenceSplitterConfig};
use crate::silence::SilenceFilter;
use crate::stt::SttStage;
use crate::tts::TtsStage;
use crate::turn::TurnAggregator;
use crate::vad::VadStage;

/// Provider instances for one session. Providers hold their own connections;
/// nothing here is shared across sessions except the robot's tool registry.
pub struct ProviderSet {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub gate: Option<Arc<dyn GateClassifier>>,
    pub memory: Option<Arc<dyn MemoryBackend>>,
    pub tools: Arc<ToolRegistry>,
    pub eye_sync: Option<EyeStateSync>,
}

/// A running session graph.
pub struct PipelineHandle {
    /// Feed canonical 16kHz mono `AudioInput` frames here.
    pub input: mpsc::Sender<Frame>,
    /// `AudioOutput` frames (and residual events) for the transport.
    output: Option<mpsc::Receiver<Frame>>,
    /// Read-only tap of every frame the graph emits.
    pub bus: broadcast::Sender<Frame>,
    pub control: Arc<TurnControl>,
    pub context: Arc<RwLock<Context>>,
    pub metrics: Arc<MetricsStore>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// The graph's output edge; the session's audio bridge takes it once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.output.take()
    }

    /// Run the unsolicited introduction turn.
    pub async fn greet(&self) {
        let _ = self.input.send(Frame::Control(ControlFrame::Greet)).await;
    }

    /// Cancel every stage task and in-flight provider call.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct Assembler {
    settings: Settings,
}

impl Assembler {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Build and start the graph for one peer.
    ///
    /// Performs the session-start memory recall (under the recall budget)
    /// before any turn runs, then spawns stages and observers.
    pub async fn build(
        &self,
        session_id: &str,
        user_id: &str,
        providers: ProviderSet,
        sink: Arc<dyn PeerSink>,
    ) -> PipelineHandle {
        let settings = &self.settings;
        let control = Arc::new(TurnControl::new());
        let context = Arc::new(RwLock::new(Context::new(
            &settings.persona,
            settings.llm.context_token_budget,
        )));
        let metrics = Arc::new(MetricsStore::new());
        let cancel = CancellationToken::new();

        if let Some(memory) = providers.memory.as_ref().filter(|_| settings.memory.enabled) {
            self.initial_recall(memory.as_ref(), user_id, &context).await;
        }

        let mut chain = ProcessorChain::new(format!("session-{}", session_id));
        chain.add_with_capacity(VadStage::new(settings.vad.clone()), queues::AUDIO_EDGE);
        chain.add_with_capacity(
            SttStage::new(providers.stt, settings.stt.clone()),
            queues::AUDIO_EDGE,
        );
        chain.add_with_capacity(
            TurnAggregator::new(settings.turn.clone(), control.clone()),
            queues::AUDIO_EDGE,
        );
        chain.add(GateStage::new(
            providers.gate,
            settings.gate.clone(),
            context.clone(),
        ));
        if let Some(memory) = providers.memory.clone().filter(|_| settings.memory.enabled) {
            chain.add(MemoryStage::new(
                memory,
                settings.memory.clone(),
                context.clone(),
            ));
        }
        let abort_grace = Duration::from_millis(settings.turn.abort_grace_ms);
        chain.add(LlmStage::new(
            providers.llm,
            providers.tools,
            context.clone(),
            control.clone(),
            settings.llm.clone(),
            abort_grace,
        ));
        chain.add(SilenceFilter::new());
        chain.add(SentenceSplitter::new(SentenceSplitterConfig::default()));
        chain.add(TtsStage::new(providers.tts, control.clone(), abort_grace));

        let (input, output, bus) = chain.run(
            ProcessorContext::new(session_id, user_id),
            cancel.clone(),
        );

        spawn_observers(
            &bus,
            ObserverDeps {
                sink,
                metrics: metrics.clone(),
                observer_config: settings.observer.clone(),
                memory_config: settings.memory.clone(),
                memory: providers.memory,
                user_id: user_id.to_string(),
                eye_sync: providers.eye_sync,
            },
            cancel.clone(),
        );

        tracing::info!(
            session_id,
            stages = chain.len(),
            memory = settings.memory.enabled,
            gate = settings.gate.enabled,
            "pipeline assembled"
        );

        PipelineHandle {
            input,
            output: Some(output),
            bus,
            control,
            context,
            metrics,
            cancel,
        }
    }

    async fn initial_recall(
        &self,
        memory: &dyn MemoryBackend,
        user_id: &str,
        context: &Arc<RwLock<Context>>,
    ) {
        let budget = Duration::from_millis(self.settings.memory.recall_budget_ms);
        match tokio::time::timeout(
            budget,
            memory.recall(user_id, "user profile and preferences", self.settings.memory.k),
        )
        .await
        {
            Ok(Ok(snippets)) if !snippets.is_empty() => {
                context
                    .write()
                    .inject_recall("From our conversations:\n", &snippets);
                tracing::info!(count = snippets.len(), "session-start recall injected");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "session-start recall failed"),
            Err(_) => tracing::debug!("session-start recall timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corvid_core::Result;

    struct NoopSink;

    #[async_trait]
    impl PeerSink for NoopSink {
        async fn send(&self, _message: corvid_transport::PeerMessage) {}
    }

    struct StubStt;

    #[async_trait]
    impl SpeechToText for StubStt {
        async fn open(&self) -> Result<Box<dyn corvid_core::SttSession>> {
            Err(corvid_core::CoreError::Provider("stub".into()))
        }
        fn provider_name(&self) -> &'static str {
            "stub"
        }
    }

    struct StubLlm;

    #[async_trait]
    impl LanguageModel for StubLlm {
        fn provider_name(&self) -> &'static str {
            "stub"
        }
        async fn chat_stream(
            &self,
            _request: corvid_core::ChatRequest,
            events: mpsc::Sender<corvid_core::LlmEvent>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            let _ = events
                .send(corvid_core::LlmEvent::Done(corvid_core::FinishReason::Stop))
                .await;
            Ok(())
        }
    }

    struct StubTts;

    #[async_trait]
    impl TextToSpeech for StubTts {
        fn output_rate(&self) -> corvid_core::SampleRate {
            corvid_core::SampleRate::Hz24000
        }
        fn provider_name(&self) -> &'static str {
            "stub"
        }
        async fn synthesize(
            &self,
            _text: &str,
            _audio_tx: mpsc::Sender<corvid_core::AudioFrame>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_assembles_and_shuts_down() {
        let assembler = Assembler::new(Settings::default());
        let providers = ProviderSet {
            stt: Arc::new(StubStt),
            llm: Arc::new(StubLlm),
            tts: Arc::new(StubTts),
            gate: None,
            memory: None,
            tools: Arc::new(ToolRegistry::new()),
            eye_sync: None,
        };

        let handle = assembler
            .build("s1", "u1", providers, Arc::new(NoopSink))
            .await;

        assert_eq!(handle.control.current_turn(), 0);
        handle.shutdown();
        assert!(handle.cancellation_token().is_cancelled());
    }
}
