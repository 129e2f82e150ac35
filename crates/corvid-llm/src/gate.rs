//! Reply gate: the conversational traffic controller.
//!
//! One short JSON-mode query to a small model decides whether the last
//! utterance addresses the assistant. The pipeline gate stage wraps this in
//! the configured budget and failure policy.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use corvid_core::{CoreError, GateClassifier, GateDecision, Message, Result, Role};

const GATE_SYSTEM_PROMPT: &str = "You are a conversational traffic controller for a voice \
assistant. Analyze the last user message. The input may carry speaker labels like 's1' or 's2'. \
Output JSON {\"reply\": true} ONLY if: the user explicitly addresses the assistant; the context \
clearly implies a question or command directed at it; or the user asks for help or information. \
Output {\"reply\": false} if users are talking to each other, thinking out loud, mumbling, or \
pausing. Be conservative: if unsure, or if the exchange is between humans, output false.";

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct ReplyGateConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub budget: Duration,
}

impl Default for ReplyGateConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            model: "qwen2.5:7b-instruct".to_string(),
            budget: Duration::from_millis(corvid_config::constants::gate::CLASSIFY_BUDGET_MS),
        }
    }
}

/// Classifier client over the OpenAI wire format.
pub struct ReplyGate {
    config: ReplyGateConfig,
    client: reqwest::Client,
}

impl ReplyGate {
    pub fn new(config: ReplyGateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.budget)
            .build()
            .map_err(|e| CoreError::Provider(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn build_user_prompt(
        utterance: &str,
        speaker_id: Option<&str>,
        recent_turns: &[Message],
    ) -> String {
        let mut prompt = String::new();
        if !recent_turns.is_empty() {
            prompt.push_str("Recent conversation:\n");
            for message in recent_turns {
                let who = match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    _ => continue,
                };
                prompt.push_str(&format!("{}: {}\n", who, message.content));
            }
            prompt.push('\n');
        }
        match speaker_id {
            Some(speaker) => {
                prompt.push_str(&format!("User message [{}]: '{}'", speaker, utterance))
            }
            None => prompt.push_str(&format!("User message: '{}'", utterance)),
        }
        prompt
    }

    fn parse_decision(content: &str) -> Result<GateDecision> {
        // Some models wrap JSON-mode output in code fences anyway.
        let cleaned = content.replace("```json", "").replace("```", "");
        let verdict: Verdict = serde_json::from_str(cleaned.trim())
            .map_err(|e| CoreError::Provider(format!("gate verdict parse: {}", e)))?;
        Ok(if verdict.reply {
            GateDecision::Allow
        } else {
            GateDecision::Suppress
        })
    }
}

#[async_trait]
impl GateClassifier for ReplyGate {
    async fn classify(
        &self,
        utterance: &str,
        speaker_id: Option<&str>,
        recent_turns: &[Message],
    ) -> Result<GateDecision> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": GATE_SYSTEM_PROMPT },
                { "role": "user", "content": Self::build_user_prompt(utterance, speaker_id, recent_turns) },
            ],
            "response_format": { "type": "json_object" },
            "max_tokens": 16,
            "temperature": 0.0,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut request = self.client.post(url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::Deadline("gate classifier".into())
            } else {
                CoreError::Network(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(CoreError::Provider(format!(
                "gate classifier HTTP {}",
                response.status()
            )));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| CoreError::Provider(format!("gate response: {}", e)))?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        let decision = Self::parse_decision(content)?;
        tracing::debug!(
            utterance = %utterance.chars().take(60).collect::<String>(),
            decision = ?decision,
            "gate decision"
        );
        Ok(decision)
    }
}

#[derive(Deserialize)]
struct Verdict {
    #[serde(default)]
    reply: bool,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision() {
        assert_eq!(
            ReplyGate::parse_decision("{\"reply\": true}").unwrap(),
            GateDecision::Allow
        );
        assert_eq!(
            ReplyGate::parse_decision("{\"reply\": false}").unwrap(),
            GateDecision::Suppress
        );
        // Fenced output still parses.
        assert_eq!(
            ReplyGate::parse_decision("```json\n{\"reply\": true}\n```").unwrap(),
            GateDecision::Allow
        );
        assert!(ReplyGate::parse_decision("not json").is_err());
    }

    #[test]
    fn test_user_prompt_includes_speaker_and_history() {
        let history = vec![Message::user("hello there"), Message::assistant("hi!")];
        let prompt = ReplyGate::build_user_prompt("yeah, I agree.", Some("s2"), &history);
        assert!(prompt.contains("user: hello there"));
        assert!(prompt.contains("assistant: hi!"));
        assert!(prompt.contains("[s2]"));
        assert!(prompt.contains("yeah, I agree."));
    }
}
