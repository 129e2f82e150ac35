//! HTTP text-to-speech adapter.
//!
//! Posts one utterance unit and streams the PCM16 response body back as
//! 20ms audio frames. Cancellation drops the connection mid-stream; no
//! frame is emitted after the token fires.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corvid_core::{AudioFrame, Channels, CoreError, Result, SampleRate, TextToSpeech};

#[derive(Debug, Clone)]
pub struct HttpTtsConfig {
    /// Service base URL; requests go to `{endpoint}/synthesize`.
    pub endpoint: String,
    pub api_key: String,
    pub voice: String,
    pub output_rate: SampleRate,
    pub request_timeout: Duration,
}

impl Default for HttpTtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8091".to_string(),
            api_key: String::new(),
            voice: "default".to_string(),
            output_rate: SampleRate::Hz24000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpTts {
    config: HttpTtsConfig,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn new(config: HttpTtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl TextToSpeech for HttpTts {
    fn output_rate(&self) -> SampleRate {
        self.config.output_rate
    }

    fn provider_name(&self) -> &'static str {
        "http-tts"
    }

    async fn synthesize(
        &self,
        text: &str,
        audio_tx: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let body = serde_json::json!({
            "text": text,
            "voice": self.config.voice,
            "format": "pcm16",
            "sample_rate": self.config.output_rate.as_u32(),
        });

        let url = format!("{}/synthesize", self.config.endpoint.trim_end_matches('/'));
        let mut request = self.client.post(url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            response = request.send() => response.map_err(|e| {
                if e.is_timeout() {
                    CoreError::Deadline("tts request".into())
                } else {
                    CoreError::Network(e.to_string())
                }
            })?,
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(CoreError::Provider(format!("tts HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(CoreError::BadInput(format!("tts HTTP {}", status)));
        }

        let chunk_bytes = self.config.output_rate.frame_size_20ms() * 2;
        let mut stream = response.bytes_stream();
        let mut carry: Vec<u8> = Vec::with_capacity(chunk_bytes * 2);
        let mut sequence: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(CoreError::Network(format!("tts stream: {}", e))),
                None => break,
            };

            carry.extend_from_slice(&bytes);
            while carry.len() >= chunk_bytes {
                let packet: Vec<u8> = carry.drain(..chunk_bytes).collect();
                let frame = AudioFrame::from_pcm16(
                    &packet,
                    self.config.output_rate,
                    Channels::Mono,
                    sequence,
                );
                sequence += 1;
                if audio_tx.send(frame).await.is_err() {
                    return Ok(());
                }
            }
        }

        // Trailing partial chunk (stream ended mid-frame).
        if carry.len() >= 2 {
            let frame =
                AudioFrame::from_pcm16(&carry, self.config.output_rate, Channels::Mono, sequence);
            let _ = audio_tx.send(frame).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_sizing() {
        let config = HttpTtsConfig::default();
        // 20ms at 24kHz mono PCM16.
        assert_eq!(config.output_rate.frame_size_20ms() * 2, 960);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_network_error() {
        let tts = HttpTts::new(HttpTtsConfig {
            endpoint: "http://127.0.0.1:1".into(),
            request_timeout: Duration::from_millis(300),
            ..Default::default()
        })
        .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let result = tts.synthesize("hello", tx, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pre_cancelled_synthesis_is_silent() {
        let tts = HttpTts::new(HttpTtsConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::channel(4);
        let result = tts.synthesize("hello", tx, cancel).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }
}
