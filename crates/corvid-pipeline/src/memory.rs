//! Memory stage: recall-on-turn and fire-and-forget store.
//!
//! Recall runs under the strict budget; on timeout the turn proceeds with no
//! snippets and no error. Stores are spawned off the turn path entirely.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corvid_config::MemoryConfig;
use corvid_core::{
    Context, Frame, FrameProcessor, FrameSender, MemoryBackend, MetricEvent, MetricKind,
    ProcessorContext, Result,
};

const RECALL_PREFIX: &str = "From our conversations:\n";

pub struct MemoryStage {
    backend: Arc<dyn MemoryBackend>,
    config: MemoryConfig,
    context: Arc<RwLock<Context>>,
}

impl MemoryStage {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        config: MemoryConfig,
        context: Arc<RwLock<Context>>,
    ) -> Self {
        Self {
            backend,
            config,
            context,
        }
    }

    async fn recall_into_context(&self, user: &str, query: &str, turn_id: u64) -> Option<Frame> {
        let budget = Duration::from_millis(self.config.recall_budget_ms);
        let started = Instant::now();

        let snippets =
            match tokio::time::timeout(budget, self.backend.recall(user, query, self.config.k))
                .await
            {
                Ok(Ok(snippets)) => snippets,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "memory recall failed, continuing without");
                    return None;
                }
                Err(_) => {
                    tracing::debug!(budget_ms = self.config.recall_budget_ms, "recall timed out");
                    return None;
                }
            };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        if !snippets.is_empty() {
            self.context.write().inject_recall(RECALL_PREFIX, &snippets);
            tracing::debug!(count = snippets.len(), "recall injected");
        }

        Some(Frame::Metric(Arc::new(MetricEvent::latency(
            "memory",
            MetricKind::Recall,
            elapsed_ms,
            turn_id,
        ))))
    }

    fn store_detached(&self, user: String, text: String) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.store(&user, &text).await {
                tracing::debug!(error = %e, "memory store failed");
            }
        });
    }
}

#[async_trait]
impl FrameProcessor for MemoryStage {
    async fn process(
        &self,
        frame: Frame,
        ctx: &mut ProcessorContext,
        out: &FrameSender,
    ) -> Result<()> {
        match frame {
            Frame::SttFinal { transcript, turn_id } => {
                if self.config.enabled {
                    if let Some(metric) = self
                        .recall_into_context(&ctx.user_id, &transcript.text, turn_id)
                        .await
                    {
                        out.send(metric).await.ok();
                    }
                    if self.config.store_user {
                        self.store_detached(ctx.user_id.clone(), transcript.text.clone());
                    }
                }
                out.send(Frame::SttFinal { transcript, turn_id }).await.ok();
            }
            // Metrics and errors only travel on the observer bus; they were
            // tapped at their emission.
            Frame::Metric(_) | Frame::Error { .. } => {}
            other => {
                out.send(other).await.ok();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
