//! Data-channel message types.
//!
//! JSON-lines of the form `{type, ...}`, server → client. The channel is the
//! only upstream path for UI metadata.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsState {
    Started,
    Stopped,
}

/// One data-channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Final user transcript.
    Transcription {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker_id: Option<String>,
    },
    /// Interim user transcript.
    Partial {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker_id: Option<String>,
    },
    /// Assistant speech started/stopped.
    TtsState { state: TtsState },
    /// Operational note, e.g. gate suppression.
    System { message: String },
    /// Structured error surfaced to the peer.
    Error { code: String, message: String },
    /// Latency snapshot for the current turn; fields are optional and only
    /// present when the corresponding stage ran.
    Metrics {
        turn_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stt_ttfb_ms: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recall_ms: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        llm_ttfb_ms: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tts_ttfb_ms: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_ms: Option<f64>,
    },
}

impl PeerMessage {
    /// Serialize to one JSON line.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcription_wire_format() {
        let msg = PeerMessage::Transcription {
            text: "hello".into(),
            speaker_id: Some("s1".into()),
        };
        let line = msg.to_line();
        assert!(line.contains("\"type\":\"transcription\""));
        assert!(line.contains("\"speaker_id\":\"s1\""));
    }

    #[test]
    fn test_speaker_id_omitted_when_absent() {
        let msg = PeerMessage::Partial {
            text: "hel".into(),
            speaker_id: None,
        };
        assert!(!msg.to_line().contains("speaker_id"));
    }

    #[test]
    fn test_tts_state_values() {
        let msg = PeerMessage::TtsState {
            state: TtsState::Started,
        };
        assert!(msg.to_line().contains("\"state\":\"started\""));
    }

    #[test]
    fn test_metrics_absent_fields_omitted() {
        let msg = PeerMessage::Metrics {
            turn_id: 3,
            stt_ttfb_ms: Some(210.0),
            recall_ms: None,
            llm_ttfb_ms: None,
            tts_ttfb_ms: None,
            total_ms: None,
        };
        let line = msg.to_line();
        assert!(line.contains("stt_ttfb_ms"));
        assert!(!line.contains("recall_ms"));
        assert!(!line.contains("llm_ttfb_ms"));
    }

    #[test]
    fn test_round_trip() {
        let msg = PeerMessage::Error {
            code: "provider_unavailable".into(),
            message: "stt 503".into(),
        };
        let parsed: PeerMessage = serde_json::from_str(&msg.to_line()).unwrap();
        assert_eq!(parsed, msg);
    }
}
