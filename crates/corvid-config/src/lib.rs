//! Configuration for the corvid voice pipeline.
//!
//! Settings are layered: defaults, then an optional `corvid.toml`, then
//! `CORVID_*` environment variables. All §deadline defaults live in
//! [`constants`] so there is exactly one place to read a budget from.

pub mod constants;
mod settings;

pub use settings::{
    GateConfig, LlmProviderConfig, MemoryConfig, ObserverConfig, RobotConfig, ServerConfig,
    Settings, SttProvider, SttProviderConfig, TtsProviderConfig, TurnConfig, VadConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
