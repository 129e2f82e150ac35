//! Application settings.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants;
use crate::ConfigError;

/// Top-level settings, deserialized from file + environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub stt: SttProviderConfig,

    #[serde(default)]
    pub llm: LlmProviderConfig,

    #[serde(default)]
    pub tts: TtsProviderConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub robot: RobotConfig,

    #[serde(default)]
    pub observer: ObserverConfig,

    /// Persona text placed at the head of every session context.
    #[serde(default = "default_persona")]
    pub persona: String,
}

fn default_persona() -> String {
    "You are a helpful voice assistant. Respond concisely and naturally; your \
     output will be spoken aloud, so avoid special characters and markup."
        .to_string()
}

impl Settings {
    /// Load from `corvid.toml` (if present) and `CORVID_*` environment
    /// variables, e.g. `CORVID_LLM__MODEL=...`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("corvid.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if path.as_ref().exists() {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        builder = builder.add_source(Environment::with_prefix("CORVID").separator("__"));

        let settings: Settings = builder
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_sessions == 0 {
            return Err(ConfigError::Invalid("server.max_sessions must be > 0".into()));
        }
        if self.memory.enabled && self.memory.k == 0 {
            return Err(ConfigError::Invalid("memory.k must be > 0 when enabled".into()));
        }
        if self.robot.enabled && self.robot.address.is_empty() {
            return Err(ConfigError::Invalid(
                "robot.address required when robot.enabled".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// STUN server URLs for ICE.
    #[serde(default = "default_stun")]
    pub stun_servers: Vec<String>,
    /// A peer connection stuck in `failed` closes the session after this.
    #[serde(default = "default_failed_close_grace_ms")]
    pub failed_close_grace_ms: u64,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7860
}
fn default_max_sessions() -> usize {
    16
}
fn default_stun() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_failed_close_grace_ms() -> u64 {
    constants::transport::FAILED_CLOSE_GRACE_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            stun_servers: default_stun(),
            failed_close_grace_ms: default_failed_close_grace_ms(),
            cors_origins: Vec::new(),
        }
    }
}

/// STT provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    #[default]
    Streaming,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttProviderConfig {
    #[serde(default)]
    pub provider: SttProvider,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Ask the provider for speaker labels.
    #[serde(default)]
    pub diarization: bool,
    #[serde(default = "default_stt_budget")]
    pub first_interim_budget_ms: u64,
}

fn default_stt_budget() -> u64 {
    constants::stt::FIRST_INTERIM_BUDGET_MS
}

impl Default for SttProviderConfig {
    fn default() -> Self {
        Self {
            provider: SttProvider::Streaming,
            endpoint: String::new(),
            api_key: String::new(),
            diarization: false,
            first_interim_budget_ms: default_stt_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_budget")]
    pub context_token_budget: usize,
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_llm_model() -> String {
    "qwen3:4b-instruct".to_string()
}
fn default_max_tokens() -> u32 {
    constants::llm::MAX_TOKENS
}
fn default_temperature() -> f32 {
    constants::llm::TEMPERATURE
}
fn default_context_budget() -> usize {
    constants::llm::CONTEXT_TOKEN_BUDGET
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_token_budget: default_context_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub voice: String,
    /// Provider-native output rate in Hz.
    #[serde(default = "default_tts_rate")]
    pub sample_rate: u32,
}

fn default_tts_rate() -> u32 {
    24_000
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            voice: String::new(),
            sample_rate: default_tts_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Classifier model; small and fast, distinct from the main LLM.
    #[serde(default = "default_gate_model")]
    pub model: String,
    #[serde(default = "default_gate_budget")]
    pub budget_ms: u64,
    /// On classifier error or timeout: reply anyway (true) or stay silent.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

fn default_gate_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}
fn default_gate_budget() -> u64 {
    constants::gate::CLASSIFY_BUDGET_MS
}
fn default_true() -> bool {
    true
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_gate_model(),
            budget_ms: default_gate_budget(),
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_k")]
    pub k: usize,
    #[serde(default = "default_recall_budget")]
    pub recall_budget_ms: u64,
    /// Store finalized user utterances.
    #[serde(default = "default_true")]
    pub store_user: bool,
    /// Also store assistant replies.
    #[serde(default)]
    pub store_assistant: bool,
    /// Embedding service endpoint for the hybrid store.
    #[serde(default)]
    pub embedding_endpoint: String,
}

fn default_memory_k() -> usize {
    constants::memory::RECALL_K
}
fn default_recall_budget() -> u64 {
    constants::memory::RECALL_BUDGET_MS
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            k: default_memory_k(),
            recall_budget_ms: default_recall_budget(),
            store_user: true,
            store_assistant: false,
            embedding_endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
    #[serde(default = "default_energy_floor")]
    pub energy_floor_db: f32,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
}

fn default_silence_ms() -> u64 {
    constants::vad::SILENCE_HANGOVER_MS
}
fn default_energy_floor() -> f32 {
    constants::vad::ENERGY_FLOOR_DB
}
fn default_min_speech_ms() -> u64 {
    constants::vad::MIN_SPEECH_MS
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_ms: default_silence_ms(),
            energy_floor_db: default_energy_floor(),
            min_speech_ms: default_min_speech_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_stabilise_ms")]
    pub stabilise_ms: u64,
    #[serde(default = "default_hard_deadline_ms")]
    pub hard_deadline_ms: u64,
    /// LLM and TTS must wind down within this budget once a turn is
    /// interrupted.
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,
}

fn default_stabilise_ms() -> u64 {
    constants::turn::STABILISE_MS
}
fn default_hard_deadline_ms() -> u64 {
    constants::turn::HARD_DEADLINE_MS
}
fn default_abort_grace_ms() -> u64 {
    constants::turn::ABORT_GRACE_MS
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            stabilise_ms: default_stabilise_ms(),
            hard_deadline_ms: default_hard_deadline_ms(),
            abort_grace_ms: default_abort_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default)]
    pub enabled: bool,
    /// gRPC address of the hardware daemon, e.g. `http://100.64.0.2:50051`.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
}

fn default_command_timeout() -> u64 {
    constants::robot::COMMAND_TIMEOUT_MS
}
fn default_capture_timeout() -> u64 {
    constants::robot::CAPTURE_TIMEOUT_MS
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            command_timeout_ms: default_command_timeout(),
            capture_timeout_ms: default_capture_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(default = "default_snapshot_ms")]
    pub snapshot_ms: u64,
    /// Forward `partial` data-channel messages while TTS is playing.
    #[serde(default)]
    pub forward_partials_during_tts: bool,
}

fn default_snapshot_ms() -> u64 {
    constants::observer::SNAPSHOT_DEBOUNCE_MS
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            snapshot_ms: default_snapshot_ms(),
            forward_partials_during_tts: false,
        }
    }
}
