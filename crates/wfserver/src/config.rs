//! Server configuration.
//!
//! Loaded with the `config` crate from environment variables prefixed with
//! `WF`, nested keys separated by `__` (`WF__ENGINE__MAX_PARALLEL_NODES`).

use serde::Deserialize;
use std::path::PathBuf;
use wfnodes::OpenAiConfig;
use wfruntime::EngineConfig;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Directory of workflow definition files loaded at start-up.
    #[serde(default)]
    pub workflows_dir: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentBackendKind {
    /// Answers with the prompt; needs no network.
    #[default]
    Echo,
    Openai,
}

/// Which backend `agent` nodes talk to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub backend: AgentBackendKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl AgentConfig {
    pub fn openai(&self) -> OpenAiConfig {
        let mut openai = OpenAiConfig::default();
        if let Some(base_url) = &self.base_url {
            openai.base_url = base_url.clone();
        }
        if let Some(model) = &self.model {
            openai.default_model = model.clone();
        }
        openai.api_key = self.api_key.clone();
        openai
    }
}

impl ServerConfig {
    /// Loads configuration from `WF__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::with_prefix("WF"))
    }

    fn from_source(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                environment
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
