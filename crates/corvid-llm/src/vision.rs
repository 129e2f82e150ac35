//! Vision provider over an OpenAI-compatible multimodal endpoint.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

use corvid_core::{CoreError, Result, VisionAnalyzer};

#[derive(Debug, Clone)]
pub struct VisionBackendConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for VisionBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            model: "moondream".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// One-shot image + prompt → text.
pub struct VisionBackend {
    config: VisionBackendConfig,
    client: reqwest::Client,
}

impl VisionBackend {
    pub fn new(config: VisionBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl VisionAnalyzer for VisionBackend {
    async fn analyse(&self, image: &[u8], prompt: &str) -> Result<String> {
        let data_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "max_tokens": 256,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut request = self.client.post(url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::Provider(format!(
                "vision HTTP {}",
                response.status()
            )));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| CoreError::Provider(format!("vision response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| CoreError::Provider("empty vision response".into()))
    }
}
