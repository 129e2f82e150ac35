//! Provider construction from settings.
//!
//! Providers keep a connection per session; the robot gRPC client is the
//! one shared handle, passed in from app state.

use std::sync::Arc;
use std::time::Duration;

use corvid_config::Settings;
use corvid_core::SampleRate;
use corvid_llm::{
    OpenAiChatBackend, OpenAiChatConfig, ReplyGate, ReplyGateConfig, VisionBackend,
    VisionBackendConfig,
};
use corvid_memory::{HttpEmbedder, HttpEmbedderConfig, HybridMemory, HybridMemoryConfig};
use corvid_pipeline::providers::{HttpStt, HttpSttConfig, HttpTts, HttpTtsConfig};
use corvid_pipeline::ProviderSet;
use corvid_robot::RobotClient;
use corvid_tools::{register_robot_tools, AnalyseSceneTool, EyeStateSync, ToolRegistry};

use crate::ServerError;

/// Build the provider set for one session.
pub fn build_provider_set(
    settings: &Settings,
    robot: Option<Arc<RobotClient>>,
) -> Result<ProviderSet, ServerError> {
    let stt = HttpStt::new(HttpSttConfig {
        endpoint: settings.stt.endpoint.clone(),
        api_key: settings.stt.api_key.clone(),
        diarization: settings.stt.diarization,
        ..Default::default()
    })
    .map_err(|e| ServerError::Init(format!("stt: {}", e)))?;

    let llm = OpenAiChatBackend::new(OpenAiChatConfig {
        endpoint: settings.llm.endpoint.clone(),
        api_key: settings.llm.api_key.clone(),
        model: settings.llm.model.clone(),
        max_tokens: settings.llm.max_tokens,
        temperature: settings.llm.temperature,
        ..Default::default()
    })
    .map_err(|e| ServerError::Init(format!("llm: {}", e)))?;

    let tts = HttpTts::new(HttpTtsConfig {
        endpoint: settings.tts.endpoint.clone(),
        api_key: settings.tts.api_key.clone(),
        voice: settings.tts.voice.clone(),
        output_rate: SampleRate::from_u32(settings.tts.sample_rate)
            .unwrap_or(SampleRate::Hz24000),
        ..Default::default()
    })
    .map_err(|e| ServerError::Init(format!("tts: {}", e)))?;

    let gate = if settings.gate.enabled {
        let gate = ReplyGate::new(ReplyGateConfig {
            endpoint: settings.llm.endpoint.clone(),
            api_key: settings.llm.api_key.clone(),
            model: settings.gate.model.clone(),
            budget: Duration::from_millis(settings.gate.budget_ms),
        })
        .map_err(|e| ServerError::Init(format!("gate: {}", e)))?;
        Some(Arc::new(gate) as Arc<dyn corvid_core::GateClassifier>)
    } else {
        None
    };

    let memory = if settings.memory.enabled {
        let embedder = HttpEmbedder::new(HttpEmbedderConfig {
            endpoint: settings.memory.embedding_endpoint.clone(),
            ..Default::default()
        })
        .map_err(|e| ServerError::Init(format!("embedder: {}", e)))?;
        Some(Arc::new(HybridMemory::new(
            Arc::new(embedder),
            HybridMemoryConfig::default(),
        )) as Arc<dyn corvid_core::MemoryBackend>)
    } else {
        None
    };

    // Hardware tools are only advertised when a robot is attached; a
    // browser-only session gets no hardware schemas in its LLM context.
    let mut tools = ToolRegistry::new();
    let eye_sync = if let Some(robot) = robot {
        register_robot_tools(&mut tools, robot.clone());
        let vision = VisionBackend::new(VisionBackendConfig {
            endpoint: settings.llm.endpoint.clone(),
            api_key: settings.llm.api_key.clone(),
            ..Default::default()
        })
        .map_err(|e| ServerError::Init(format!("vision: {}", e)))?;
        tools.register(AnalyseSceneTool::new(robot.clone(), Arc::new(vision)));
        Some(EyeStateSync::new(robot))
    } else {
        None
    };

    Ok(ProviderSet {
        stt: Arc::new(stt),
        llm: Arc::new(llm),
        tts: Arc::new(tts),
        gate,
        memory,
        tools: Arc::new(tools),
        eye_sync,
    })
}
