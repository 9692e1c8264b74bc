//! Configuration management for db-parley.
//!
//! Handles loading configuration from a TOML file, with environment
//! variables layered on top for the LLM provider settings.

use crate::error::{ParleyError, Result};
use crate::query::ChartPolicyKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// LLM provider configuration.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Query flow limits and policies.
    #[serde(default)]
    pub flow: FlowConfig,

    /// External database execution settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Application state database settings.
    #[serde(default)]
    pub state: StateConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// LLM provider: "openai" or "mock".
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model name (e.g., "gpt-4o").
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible endpoint (e.g. a local Ollama server).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Limits and policies of the generate→execute→observe loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Maximum number of model proposals per query.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Maximum rows materialized per statement.
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,

    /// Past exchanges loaded into the model context.
    #[serde(default = "default_history_exchanges")]
    pub history_exchanges: usize,

    /// Whether the model may run mutating statements.
    #[serde(default)]
    pub allow_writes: bool,

    /// How results are marked chart-eligible.
    #[serde(default)]
    pub chart_policy: ChartPolicyKind,
}

fn default_max_steps() -> usize {
    5
}

fn default_row_limit() -> usize {
    10
}

fn default_history_exchanges() -> usize {
    10
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            row_limit: default_row_limit(),
            history_exchanges: default_history_exchanges(),
            allow_writes: false,
            chart_policy: ChartPolicyKind::default(),
        }
    }
}

/// External database execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Upper bound for one statement, in seconds.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Upper bound for establishing a connection, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_query_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Application state database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path of the SQLite state file; platform default when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Pool size shared by all concurrent invocations.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("db-parley")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file; a missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ParleyError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            ParleyError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the flow cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.flow.max_steps == 0 {
            return Err(ParleyError::config("flow.max_steps must be at least 1"));
        }
        if self.flow.row_limit == 0 {
            return Err(ParleyError::config("flow.row_limit must be at least 1"));
        }
        if self.state.max_connections == 0 {
            return Err(ParleyError::config(
                "state.max_connections must be at least 1",
            ));
        }
        Ok(())
    }

    /// Applies `PARLEY_LLM_PROVIDER`, `OPENAI_MODEL` and `OPENAI_BASE_URL`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(provider) = std::env::var("PARLEY_LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }
    }

    /// Returns the configured state database path or the platform default.
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state.path {
            Some(path) => Ok(path.clone()),
            None => crate::persistence::StateDb::default_path(),
        }
    }
}
