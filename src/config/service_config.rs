//! gitopsd configuration file handling
//!
//! Loads and saves ~/.config/gitopsd/config.yaml.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SSH agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Bind to an SSH agent on first activity
    #[serde(default = "default_agent_enabled")]
    pub enabled: bool,

    /// Agent socket; `SSH_AUTH_SOCK` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,

    /// How long CLI commands wait for the agent handshake
    #[serde(default = "default_bind_timeout_secs")]
    pub bind_timeout_secs: u64,
}

fn default_agent_enabled() -> bool {
    true
}

fn default_bind_timeout_secs() -> u64 {
    5
}

impl AgentConfig {
    /// Configured socket, falling back to `SSH_AUTH_SOCK`
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket
            .clone()
            .or_else(|| std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from))
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: default_agent_enabled(),
            socket: None,
            bind_timeout_secs: default_bind_timeout_secs(),
        }
    }
}

/// Clone settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Create bare repositories
    #[serde(default)]
    pub bare: bool,
}

/// gitopsd configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Remote fetched when a request names none
    #[serde(default = "default_remote")]
    pub default_remote: String,

    /// Events buffered per subscriber before the slowest one lags
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub clone: CloneConfig,
}

fn default_remote() -> String {
    crate::git::DEFAULT_REMOTE_NAME.to_string()
}

fn default_event_channel_capacity() -> usize {
    crate::notify::DEFAULT_EVENT_CHANNEL_CAPACITY
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self {
            default_remote: default_remote(),
            event_channel_capacity: default_event_channel_capacity(),
            agent: AgentConfig::default(),
            clone: CloneConfig::default(),
        }
    }

    /// Load from the default path, or defaults when there is no file yet
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::GitOpsError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading gitopsd configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            default_remote = %config.default_remote,
            agent_enabled = config.agent.enabled,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving gitopsd configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/gitopsd/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("gitopsd");
        path.push("config.yaml");
        path
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}
