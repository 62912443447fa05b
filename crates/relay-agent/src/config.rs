//! Agent configuration.
//!
//! Layers, lowest first: built-in defaults, an optional TOML file, then
//! `RELAY_AGENT__SECTION__KEY` environment variables. Command-line flags
//! are applied on top by the binary.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::health::HealthcheckConfig;
use crate::reverse::{DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES, ReverseOptions};

pub const APP_NAME: &str = "relay";
pub const ENV_PREFIX: &str = "RELAY_AGENT";
pub const DEFAULT_ADDR: &str = "0.0.0.0:9111";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub main_process: MainProcessConfig,
    pub reverse: ReverseConfig,
    pub healthcheck: HealthcheckSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    /// Shared bearer token. Empty disables authentication.
    pub token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainProcessConfig {
    /// Spawn and supervise a main process.
    pub keep_alive: bool,
    /// Main process argv; empty means an interactive `/bin/sh`.
    pub args: Vec<String>,
    /// Extra `KEY=VALUE` entries for the main process environment.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseConfig {
    /// Dial this URL instead of listening.
    pub callback_url: String,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReverseConfig {
    fn default() -> Self {
        Self {
            callback_url: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_ms: DEFAULT_BASE_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthcheckSection {
    pub test: Vec<String>,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub start_period_ms: u64,
    pub retries: u32,
}

impl HealthcheckSection {
    /// Zero durations and retries fall back to the checker's defaults.
    pub fn to_config(&self) -> HealthcheckConfig {
        HealthcheckConfig {
            test: self.test.clone(),
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            start_period: Duration::from_millis(self.start_period_ms),
            retries: self.retries,
        }
        .normalized()
    }
}

impl AgentConfig {
    /// Load from `path` (if it exists) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let built = Config::builder()
            .set_default("server.addr", DEFAULT_ADDR)
            .and_then(|b| b.set_default("reverse.max_retries", i64::from(DEFAULT_MAX_RETRIES)))
            .map_err(config_error)?
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(config_error)?;

        let mut config: AgentConfig = built.try_deserialize().map_err(config_error)?;
        config.server.addr = normalize_addr(&config.server.addr);
        Ok(config)
    }

    pub fn is_reverse(&self) -> bool {
        !self.reverse.callback_url.is_empty()
    }

    pub fn reverse_options(&self) -> Option<ReverseOptions> {
        if !self.is_reverse() {
            return None;
        }
        Some(ReverseOptions {
            max_retries: self.reverse.max_retries.max(1),
            base_backoff: Duration::from_millis(self.reverse.base_backoff_ms),
            max_backoff: Duration::from_millis(self.reverse.max_backoff_ms),
            ..ReverseOptions::new(&self.reverse.callback_url, &self.server.token)
        })
    }

    pub fn healthcheck(&self) -> Option<HealthcheckConfig> {
        let config = self.healthcheck.to_config();
        (!config.is_disabled()).then_some(config)
    }
}

fn config_error(err: config::ConfigError) -> AgentError {
    AgentError::Config(err.to_string())
}

/// Accept the `:PORT` shorthand for all interfaces.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// `$XDG_CONFIG_HOME/relay/agent.toml`, or the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join(APP_NAME).join("agent.toml"));
    }
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join("agent.toml"))
}
