//! Memory and vision provider traits.

use async_trait::async_trait;

use crate::error::Result;

/// Long-term memory behind a request/response capability.
///
/// `recall` runs under a strict budget on the turn path; implementations
/// return what they have and the caller treats a timeout as an empty result.
/// `store` is fire-and-forget from finalized utterances.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn recall(&self, user: &str, query: &str, k: usize) -> Result<Vec<String>>;

    async fn store(&self, user: &str, text: &str) -> Result<()>;
}

/// Image understanding provider, fed by the robot camera capture tool.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyse(&self, image: &[u8], prompt: &str) -> Result<String>;
}
