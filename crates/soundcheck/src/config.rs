//! Configuration: defaults, optional TOML file, environment overlay.
//!
//! Load order is defaults → file → environment, last writer wins. The file
//! is `soundcheck.toml` in the working directory unless `--config` points
//! elsewhere. Environment keys are listed next to the fields they
//! override.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use liveset::ObserverConfig;
use mixchat::ProviderConfig;
use oscwire::OscConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: BindConfig,
    pub osc: OscSettings,
    pub observer: ObserverSettings,
    pub llm: LlmSettings,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

/// HTTP bind address. `SOUNDCHECK_HTTP_HOST` / `SOUNDCHECK_HTTP_PORT`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// OSC socket pair and timeouts. `SOUNDCHECK_OSC_LOCAL_PORT`,
/// `SOUNDCHECK_OSC_REMOTE_PORT`, `SOUNDCHECK_OSC_REMOTE_HOST`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OscSettings {
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_host: String,
    pub liveness_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for OscSettings {
    fn default() -> Self {
        Self {
            local_port: 11001,
            remote_port: 11000,
            remote_host: "127.0.0.1".to_string(),
            liveness_timeout_secs: 5,
            query_timeout_secs: 2,
        }
    }
}

/// Debounce and history window. `SOUNDCHECK_DEBOUNCE_MS`,
/// `SOUNDCHECK_HISTORY_WINDOW_SECS`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverSettings {
    pub debounce_ms: u64,
    pub history_window_secs: u64,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            history_window_secs: 30 * 60,
        }
    }
}

/// Completion endpoint. The key comes from `ANTHROPIC_API_KEY`; the model
/// can be overridden with `SOUNDCHECK_MODEL`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    #[serde(skip)]
    pub api_key: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        let defaults = ProviderConfig::default();
        Self {
            base_url: defaults.base_url,
            model: defaults.model,
            max_tokens: defaults.max_tokens,
            temperature: None,
            api_key: String::new(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the file (if any), then the
    /// environment.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = match cli_path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let local = PathBuf::from("soundcheck.toml");
                local.exists().then_some(local)
            }
        };

        let mut config = match &path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("cannot parse config file {}", path.display()))?
            }
            None => Config::default(),
        };
        if let Some(path) = &path {
            info!(path = %path.display(), "loaded config file");
        }

        config.apply_env();
        Ok(config)
    }

    /// Overlay environment variables onto the loaded values.
    fn apply_env(&mut self) {
        fn env_var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = env_var("SOUNDCHECK_HTTP_HOST") {
            self.bind.host = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.bind.port = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_OSC_LOCAL_PORT").and_then(|v| v.parse().ok()) {
            self.osc.local_port = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_OSC_REMOTE_PORT").and_then(|v| v.parse().ok()) {
            self.osc.remote_port = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_OSC_REMOTE_HOST") {
            self.osc.remote_host = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.observer.debounce_ms = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_HISTORY_WINDOW_SECS").and_then(|v| v.parse().ok()) {
            self.observer.history_window_secs = v;
        }
        if let Some(v) = env_var("SOUNDCHECK_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env_var("ANTHROPIC_API_KEY") {
            self.llm.api_key = v;
        }
    }

    pub fn osc_config(&self) -> OscConfig {
        OscConfig {
            local_port: self.osc.local_port,
            remote_host: self.osc.remote_host.clone(),
            remote_port: self.osc.remote_port,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.osc.query_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.osc.liveness_timeout_secs)
    }

    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            debounce: Duration::from_millis(self.observer.debounce_ms),
            history_window: Duration::from_secs(self.observer.history_window_secs),
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: self.llm.base_url.clone(),
            api_key: self.llm.api_key.clone(),
            model: self.llm.model.clone(),
            max_tokens: self.llm.max_tokens,
            temperature: self.llm.temperature,
        }
    }
}
