//! Embedding providers for the hybrid store.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use corvid_core::{CoreError, Result};

/// Text → vector seam so the store can be tested without a network.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// HTTP embedding service configuration.
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// Endpoint accepting `{model, prompt}` and returning `{embedding: [..]}`.
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/embeddings".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout: Duration::from_millis(40),
        }
    }
}

/// Embedder over an embeddings HTTP service.
pub struct HttpEmbedder {
    config: HttpEmbedderConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": text,
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Deadline("embedding".into())
                } else {
                    CoreError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Provider(format!(
                "embedding HTTP {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Provider(format!("embedding response: {}", e)))?;

        if parsed.embedding.is_empty() {
            return Err(CoreError::Provider("empty embedding".into()));
        }
        Ok(parsed.embedding)
    }
}
