use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::delegate::DEFAULT_MAX_DEPTH;
use crate::error::{Result, TurnloopError};
use crate::llm::OPENROUTER_BASE_URL;
use crate::session::DEFAULT_LOG_DIR;
use crate::tools::shell::ShellConfig;
use crate::tools::web::WebSearchConfig;

pub const DEFAULT_MODEL: &str = "anthropic/claude-opus-4.5";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenRouter,
    /// Canned responses, no network.
    Scripted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_reasoning_max_tokens")]
    pub reasoning_max_tokens: Option<u32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            api_key: None,
            base_url: default_base_url(),
            stream: false,
            reasoning_max_tokens: default_reasoning_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_base_url() -> String {
    OPENROUTER_BASE_URL.into()
}

fn default_reasoning_max_tokens() -> Option<u32> {
    Some(5000)
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Unbounded when unset.
    #[serde(default)]
    pub max_rounds: Option<usize>,
    #[serde(default = "default_max_depth")]
    pub max_delegation_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: None,
            max_delegation_depth: default_max_depth(),
        }
    }
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Key for the `web_search` tool.
    #[serde(default)]
    pub tavily_api_key: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout(),
            working_dir: None,
            tavily_api_key: None,
        }
    }
}

fn default_shell_timeout() -> u64 {
    120
}

impl ToolsConfig {
    pub fn shell(&self) -> ShellConfig {
        ShellConfig {
            base_dir: self.working_dir.clone(),
            timeout_secs: self.shell_timeout_secs,
            ..ShellConfig::default()
        }
    }

    pub fn web(&self) -> WebSearchConfig {
        WebSearchConfig {
            api_key: self.tavily_api_key.clone(),
            ..WebSearchConfig::default()
        }
    }
}

/// A role the `delegate` tool can run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub system_prompt: String,
    /// Names of the tools the role may call.
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentProfile>,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| TurnloopError::Config(format!("Failed to parse configuration: {err}")))
    }

    /// Load `path` and apply environment overrides.
    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENROUTER_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(model) = lookup("AGENT_MODEL") {
            self.model.model = model;
        }
        if let Some(provider) = lookup("TURNLOOP_PROVIDER") {
            match provider.to_ascii_lowercase().as_str() {
                "openrouter" => self.model.provider = Provider::OpenRouter,
                "scripted" => self.model.provider = Provider::Scripted,
                other => tracing::warn!(provider = other, "ignoring unknown TURNLOOP_PROVIDER"),
            }
        }
        if let Some(base_url) = lookup("TURNLOOP_BASE_URL") {
            self.model.base_url = base_url;
        }
        if let Some(stream) = lookup("TURNLOOP_STREAMING") {
            if let Ok(parsed) = stream.parse::<bool>() {
                self.model.stream = parsed;
            }
        }
        if let Some(rounds) = lookup("TURNLOOP_MAX_ROUNDS") {
            if let Ok(parsed) = rounds.parse::<usize>() {
                self.engine.max_rounds = Some(parsed);
            }
        }
        if let Some(depth) = lookup("TURNLOOP_MAX_DEPTH") {
            if let Ok(parsed) = depth.parse::<usize>() {
                self.engine.max_delegation_depth = parsed;
            }
        }
        if let Some(key) = lookup("TAVILY_API_KEY") {
            self.tools.tavily_api_key = Some(key);
        }
        if let Some(dir) = lookup("TURNLOOP_LOG_DIR") {
            self.session.log_dir = PathBuf::from(dir);
        }
        if let Some(json) = lookup("TURNLOOP_LOG_JSON") {
            if let Ok(parsed) = json.parse::<bool>() {
                self.logging.json = parsed;
            }
        }
    }

    /// Reject settings that would only fail once a turn is running.
    pub fn validate(&self) -> Result<()> {
        if self.model.provider == Provider::OpenRouter
            && self.model.api_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(TurnloopError::Config(
                "OPENROUTER_API_KEY is not set and [model].api_key is empty".into(),
            ));
        }
        if self.model.model.trim().is_empty() {
            return Err(TurnloopError::Config("[model].model must not be empty".into()));
        }
        if self.engine.max_rounds == Some(0) {
            return Err(TurnloopError::Config("[engine].max_rounds must be at least 1".into()));
        }
        for (name, profile) in &self.agents {
            if profile.system_prompt.trim().is_empty() {
                return Err(TurnloopError::Config(format!(
                    "agent `{name}` needs a system_prompt"
                )));
            }
        }
        Ok(())
    }
}
