//! Reply gate stage.
//!
//! Each `SttFinal` is classified under the gate budget: allow forwards the
//! turn, suppress drops it leaving only a `gate_suppress` metric behind (the
//! observer turns that into the peer's `system` note). Classifier errors and
//! timeouts consult the configured failure policy; the default fails open so
//! a broken classifier never silences the assistant.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use corvid_config::constants::gate::HISTORY_TURNS;
use corvid_config::GateConfig;
use corvid_core::{
    Context, Frame, FrameProcessor, FrameSender, GateClassifier, GateDecision, MetricEvent,
    MetricKind, ProcessorContext, Result,
};

pub struct GateStage {
    classifier: Option<Arc<dyn GateClassifier>>,
    config: GateConfig,
    context: Arc<RwLock<Context>>,
}

impl GateStage {
    pub fn new(
        classifier: Option<Arc<dyn GateClassifier>>,
        config: GateConfig,
        context: Arc<RwLock<Context>>,
    ) -> Self {
        Self {
            classifier,
            config,
            context,
        }
    }

    async fn decide(&self, utterance: &str, speaker_id: Option<&str>) -> GateDecision {
        let Some(classifier) = (self.config.enabled).then_some(()).and(self.classifier.clone())
        else {
            return GateDecision::Allow;
        };

        let recent = self.context.read().recent(HISTORY_TURNS);
        let budget = Duration::from_millis(self.config.budget_ms);

        match tokio::time::timeout(budget, classifier.classify(utterance, speaker_id, &recent))
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, fail_open = self.config.fail_open, "gate classifier error");
                self.fallback()
            }
            Err(_) => {
                tracing::warn!(
                    budget_ms = self.config.budget_ms,
                    fail_open = self.config.fail_open,
                    "gate classifier timed out"
                );
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> GateDecision {
        if self.config.fail_open {
            GateDecision::Allow
        } else {
            GateDecision::Suppress
        }
    }
}

#[async_trait]
impl FrameProcessor for GateStage {
    async fn process(
        &self,
        frame: Frame,
        _ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            Frame::SttFinal { transcript, turn_id } => {
                let decision = self
                    .decide(&transcript.text, transcript.speaker_id.as_deref())
                    .await;

                match decision {
                    GateDecision::Allow => {
                        tracing::debug!(turn_id, "gate: pass");
                        out.send(Frame::SttFinal { transcript, turn_id }).await.ok();
                    }
                    GateDecision::Suppress => {
                        tracing::info!(
                            turn_id,
                            text = %transcript.text.chars().take(60).collect::<String>(),
                            "gate: suppressed"
                        );
                        // The suppressed turn produces exactly this metric
                        // and nothing else downstream.
                        let metric =
                            MetricEvent::marker("gate", MetricKind::GateSuppress, turn_id);
                        out.send(Frame::Metric(Arc::new(metric))).await.ok();
                    }
                }
            }
            // Upstream metrics were tapped onto the bus at emission.
            Frame::Metric(_) => {}
            other => {
                out.send(other).await.ok();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "gate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::{CoreError, Message, Transcript};
    use tokio::sync::mpsc;

    struct FixedClassifier(GateDecision);

    #[async_trait]
    impl GateClassifier for FixedClassifier {
        async fn classify(
            &self,
            _utterance: &str,
            _speaker_id: Option<&str>,
            _recent: &[Message],
        ) -> Result<GateDecision> {
            Ok(self.0)
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl GateClassifier for FailingClassifier {
        async fn classify(
            &self,
            _utterance: &str,
            _speaker_id: Option<&str>,
            _recent: &[Message],
        ) -> Result<GateDecision> {
            Err(CoreError::Network("classifier down".into()))
        }
    }

    struct SlowClassifier;

    #[async_trait]
    impl GateClassifier for SlowClassifier {
        async fn classify(
            &self,
            _utterance: &str,
            _speaker_id: Option<&str>,
            _recent: &[Message],
        ) -> Result<GateDecision> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GateDecision::Suppress)
        }
    }

    fn shared_context() -> Arc<RwLock<Context>> {
        Arc::new(RwLock::new(Context::new("persona", 8_192)))
    }

    fn final_frame(text: &str, speaker: Option<&str>) -> Frame {
        let mut transcript = Transcript::new(text);
        if let Some(s) = speaker {
            transcript = transcript.with_speaker(s);
        }
        Frame::SttFinal {
            transcript,
            turn_id: 1,
        }
    }

    async fn run_gate(gate: GateStage, frame: Frame) -> Vec<Frame> {
        let mut ctx = ProcessorContext::default();
        let (tx, mut rx) = mpsc::channel(8);
        gate.process(frame, &mut ctx, &tx).await.unwrap();
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    #[tokio::test]
    async fn test_allow_forwards_final() {
        let gate = GateStage::new(
            Some(Arc::new(FixedClassifier(GateDecision::Allow))),
            GateConfig::default(),
            shared_context(),
        );
        let frames = run_gate(gate, final_frame("what time is it", None)).await;
        assert!(matches!(frames[0], Frame::SttFinal { .. }));
    }

    #[tokio::test]
    async fn test_suppress_leaves_only_metric() {
        let gate = GateStage::new(
            Some(Arc::new(FixedClassifier(GateDecision::Suppress))),
            GateConfig::default(),
            shared_context(),
        );
        let frames = run_gate(gate, final_frame("yeah, I agree.", Some("s2"))).await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Metric(m) => {
                assert_eq!(m.kind, MetricKind::GateSuppress);
                assert_eq!(m.turn_id, Some(1));
            }
            other => panic!("unexpected frame {:?}", other.tag()),
        }
    }

    #[tokio::test]
    async fn test_classifier_error_fails_open() {
        let gate = GateStage::new(
            Some(Arc::new(FailingClassifier)),
            GateConfig::default(),
            shared_context(),
        );
        let frames = run_gate(gate, final_frame("hello", None)).await;
        assert!(matches!(frames[0], Frame::SttFinal { .. }));
    }

    #[tokio::test]
    async fn test_classifier_error_fail_closed_when_configured() {
        let gate = GateStage::new(
            Some(Arc::new(FailingClassifier)),
            GateConfig {
                fail_open: false,
                ..Default::default()
            },
            shared_context(),
        );
        let frames = run_gate(gate, final_frame("hello", None)).await;
        assert!(matches!(frames[0], Frame::Metric(_)));
    }

    #[tokio::test]
    async fn test_timeout_fails_open() {
        let gate = GateStage::new(
            Some(Arc::new(SlowClassifier)),
            GateConfig {
                budget_ms: 20,
                ..Default::default()
            },
            shared_context(),
        );
        let frames = run_gate(gate, final_frame("hello", None)).await;
        assert!(matches!(frames[0], Frame::SttFinal { .. }));
    }

    #[tokio::test]
    async fn test_disabled_gate_passes_everything() {
        let gate = GateStage::new(
            Some(Arc::new(FixedClassifier(GateDecision::Suppress))),
            GateConfig {
                enabled: false,
                ..Default::default()
            },
            shared_context(),
        );
        let frames = run_gate(gate, final_frame("side chatter", None)).await;
        assert!(matches!(frames[0], Frame::SttFinal { .. }));
    }
}
