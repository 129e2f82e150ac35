//! The stage contract.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::frame::Frame;

/// Outbound edge of a stage.
pub type FrameSender = mpsc::Sender<Frame>;

/// Context handed to every processor in a session's graph.
#[derive(Debug, Clone, Default)]
pub struct ProcessorContext {
    pub session_id: String,
    /// Peer identity used for memory recall/store.
    pub user_id: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProcessorContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            metadata: HashMap::new(),
        }
    }
}

/// One pipeline stage.
///
/// Each processor runs in its own task, connected to its neighbours by
/// bounded channels. `process` consumes one frame and pushes zero or more
/// frames downstream through `out` — immediately for streamed output, so a
/// slow tail of work never delays the first byte. Sending on a full audio
/// edge blocks the producer; that backpressure is intentional.
#[async_trait]
pub trait FrameProcessor: Send + Sync + 'static {
    async fn process(&self, frame: Frame, ctx: &mut ProcessorContext, out: &FrameSender)
        -> Result<()>;

    /// Stage name used in traces, error frames, and metrics.
    fn name(&self) -> &'static str;

    /// Called once before the first frame; may open provider streams.
    async fn on_start(&self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Called on every exit path, including cancellation.
    async fn on_stop(&self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}
