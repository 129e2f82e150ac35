//! OpenAI-compatible chat-completions backend.
//!
//! Streams completion tokens over SSE and surfaces tool-call payloads as
//! structured events. Transient failures at request time are retried with
//! exponential backoff and jitter; mid-stream failures abort the turn.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corvid_core::{
    ChatRequest, CoreError, FinishReason, LanguageModel, LlmEvent, Message, Result, Role,
};

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct OpenAiChatConfig {
    /// Base URL including the version segment, e.g. `https://api.example.com/v1`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for OpenAiChatConfig {
    fn default() -> Self {
        use corvid_config::constants::llm;
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            model: "qwen3:4b-instruct".to_string(),
            max_tokens: llm::MAX_TOKENS,
            temperature: llm::TEMPERATURE,
            timeout: Duration::from_secs(llm::REQUEST_TIMEOUT_SECS),
            max_retries: llm::MAX_RETRIES,
            initial_backoff: Duration::from_millis(llm::INITIAL_BACKOFF_MS),
        }
    }
}

/// Streaming chat backend speaking the OpenAI wire format.
pub struct OpenAiChatBackend {
    config: OpenAiChatConfig,
    client: reqwest::Client,
}

impl OpenAiChatBackend {
    pub fn new(config: OpenAiChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    fn wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                },
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|c| WireToolCall {
                                id: c.call_id.clone(),
                                kind: "function".to_string(),
                                function: WireFunction {
                                    name: c.name.clone(),
                                    arguments: c.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                },
            })
            .collect()
    }

    /// Send the request, retrying transient failures until a stream opens.
    async fn open_stream(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let mut request = self.client.post(self.chat_url()).json(body);
            if !self.config.api_key.is_empty() {
                request = request.bearer_auth(&self.config.api_key);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                result = request.send() => result,
            };

            let error = match outcome {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let detail = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        CoreError::Network(format!("HTTP {}: {}", status, detail))
                    } else {
                        return Err(CoreError::Provider(format!("HTTP {}: {}", status, detail)));
                    }
                }
                Err(e) if e.is_timeout() => CoreError::Deadline(e.to_string()),
                Err(e) => CoreError::Network(e.to_string()),
            };

            attempt += 1;
            if attempt > self.config.max_retries || !error.is_retryable() {
                return Err(match error {
                    CoreError::Network(detail) => CoreError::Provider(detail),
                    other => other,
                });
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % 50);
            tracing::warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "chat request failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(backoff + jitter) => {}
            }
            backoff *= 2;
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatBackend {
    fn provider_name(&self) -> &'static str {
        "openai-chat"
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<LlmEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": Self::wire_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }

        let response = self.open_stream(&body, &cancel).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut pending_tools: Vec<PendingToolCall> = Vec::new();
        let mut finish = FinishReason::Stop;

        'outer: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = events.send(LlmEvent::Done(FinishReason::Cancelled)).await;
                    return Ok(());
                }
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(CoreError::Network(e.to_string())),
                None => break,
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }

                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unparseable SSE chunk");
                        continue;
                    }
                };

                let Some(choice) = parsed.choices.into_iter().next() else {
                    continue;
                };

                if let Some(reason) = choice.finish_reason.as_deref() {
                    finish = match reason {
                        "tool_calls" => FinishReason::ToolUse,
                        "length" => FinishReason::Length,
                        _ => FinishReason::Stop,
                    };
                }

                if let Some(text) = choice.delta.content {
                    if !text.is_empty() {
                        if events.send(LlmEvent::Delta(text)).await.is_err() {
                            return Ok(());
                        }
                    }
                }

                for delta in choice.delta.tool_calls.unwrap_or_default() {
                    let index = delta.index;
                    while pending_tools.len() <= index {
                        pending_tools.push(PendingToolCall::default());
                    }
                    let pending = &mut pending_tools[index];
                    if let Some(id) = delta.id {
                        pending.id = id;
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            pending.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            pending.arguments.push_str(&arguments);
                        }
                    }
                }
            }
        }

        // Flush accumulated tool calls once the stream ends.
        for pending in pending_tools.drain(..) {
            if pending.name.is_empty() {
                continue;
            }
            let arguments = serde_json::from_str(&pending.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default()));
            let event = LlmEvent::ToolCallRequest {
                call_id: pending.id,
                name: pending.name,
                arguments,
            };
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        let _ = events.send(LlmEvent::Done(finish)).await;
        Ok(())
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_roles() {
        let messages = vec![
            Message::system("persona"),
            Message::user("hello"),
            Message::assistant("hi"),
            Message::tool("c1", "ok"),
        ];
        let wire = OpenAiChatBackend::wire_messages(&messages);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[3].role, "tool");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_stream_chunk_parse_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn test_stream_chunk_parse_tool_delta() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"execute_movement","arguments":"{\"ges"}}]},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        let deltas = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(deltas[0].id.as_deref(), Some("call_1"));
        assert_eq!(
            deltas[0].function.as_ref().unwrap().name.as_deref(),
            Some("execute_movement")
        );
    }

    #[test]
    fn test_chat_url() {
        let backend = OpenAiChatBackend::new(OpenAiChatConfig {
            endpoint: "http://localhost:11434/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.chat_url(), "http://localhost:11434/v1/chat/completions");
    }
}
