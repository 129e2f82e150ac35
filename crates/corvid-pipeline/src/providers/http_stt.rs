//! HTTP speech-to-text adapter.
//!
//! Buffers utterance audio and posts it to a transcription service: partial
//! requests at a fixed cadence while speech is live, one final request at
//! finalize. Speaker labels returned by the service pass through untouched.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use corvid_core::{
    AudioFrame, CoreError, Result, SpeechToText, SttEvent, SttSession, Transcript,
};

#[derive(Debug, Clone)]
pub struct HttpSttConfig {
    /// Service base URL; requests go to `{endpoint}/transcribe`.
    pub endpoint: String,
    pub api_key: String,
    /// Ask for speaker labels.
    pub diarization: bool,
    /// Cadence of partial-hypothesis requests while audio accumulates.
    pub partial_interval: Duration,
    /// Do not bother the service below this much audio (samples at 16kHz).
    pub min_audio_samples: usize,
    pub request_timeout: Duration,
}

impl Default for HttpSttConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8090".to_string(),
            api_key: String::new(),
            diarization: false,
            partial_interval: Duration::from_millis(300),
            min_audio_samples: 1_600, // 100ms
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct HttpStt {
    config: HttpSttConfig,
    client: reqwest::Client,
}

impl HttpStt {
    pub fn new(config: HttpSttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SpeechToText for HttpStt {
    async fn open(&self) -> Result<Box<dyn SttSession>> {
        // A cheap liveness probe so a dead service fails the open, which is
        // where the stage's retry budget applies.
        let health = format!("{}/health", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&health)
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("stt health: {}", e)))?;
        if response.status().is_server_error() {
            return Err(CoreError::Network(format!(
                "stt health HTTP {}",
                response.status()
            )));
        }

        Ok(Box::new(HttpSttSession {
            config: self.config.clone(),
            client: self.client.clone(),
            buffer: Vec::new(),
            last_partial_at: None,
            pending: VecDeque::new(),
        }))
    }

    fn provider_name(&self) -> &'static str {
        "http-stt"
    }
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    speaker_id: Option<String>,
}

struct HttpSttSession {
    config: HttpSttConfig,
    client: reqwest::Client,
    buffer: Vec<f32>,
    last_partial_at: Option<Instant>,
    pending: VecDeque<SttEvent>,
}

impl HttpSttSession {
    async fn transcribe(&self, samples: &[f32], is_final: bool) -> Result<Option<Transcript>> {
        if samples.len() < self.config.min_audio_samples {
            return Ok(None);
        }

        let pcm16: Vec<u8> = samples
            .iter()
            .flat_map(|&s| ((s.clamp(-1.0, 1.0) * 32767.0) as i16).to_le_bytes())
            .collect();

        let body = serde_json::json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(&pcm16),
            "sample_rate": 16_000,
            "final": is_final,
            "diarization": self.config.diarization,
        });

        let url = format!("{}/transcribe", self.config.endpoint.trim_end_matches('/'));
        let mut request = self.client.post(url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("stt request: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CoreError::Network(format!("stt HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(CoreError::Provider(format!("stt HTTP {}", status)));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Provider(format!("stt response: {}", e)))?;

        if parsed.text.trim().is_empty() {
            return Ok(None);
        }

        let mut transcript = Transcript::new(parsed.text);
        transcript.speaker_id = parsed.speaker_id;
        Ok(Some(transcript))
    }

    fn partial_due(&self) -> bool {
        self.last_partial_at
            .map(|t| t.elapsed() >= self.config.partial_interval)
            .unwrap_or(true)
    }
}

#[async_trait]
impl SttSession for HttpSttSession {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        self.buffer.extend(frame.samples.iter());

        if self.partial_due() && self.buffer.len() >= self.config.min_audio_samples {
            self.last_partial_at = Some(Instant::now());
            let samples = self.buffer.clone();
            if let Some(transcript) = self.transcribe(&samples, false).await? {
                self.pending.push_back(SttEvent::Interim(transcript));
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<SttEvent>> {
        match self.pending.pop_front() {
            Some(event) => Ok(Some(event)),
            None => {
                // Nothing buffered; events only materialize on audio pushes,
                // so park until the caller's poll window expires.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn finalize(&mut self) -> Result<Option<Transcript>> {
        let samples = std::mem::take(&mut self.buffer);
        self.last_partial_at = None;
        self.pending.clear();
        self.transcribe(&samples, true).await
    }

    async fn close(&mut self) -> Result<()> {
        self.buffer.clear();
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HttpSttConfig::default();
        assert_eq!(config.partial_interval, Duration::from_millis(300));
        assert_eq!(config.min_audio_samples, 1_600);
    }

    #[test]
    fn test_transcribe_response_parse() {
        let json = r#"{"text": "hello there", "speaker_id": "s1"}"#;
        let parsed: TranscribeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.text, "hello there");
        assert_eq!(parsed.speaker_id.as_deref(), Some("s1"));

        let json = r#"{"text": "no speaker"}"#;
        let parsed: TranscribeResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.speaker_id.is_none());
    }
}
