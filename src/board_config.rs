//! Unified configuration for flowboard.
//!
//! Settings are layered, lowest precedence first:
//! 1. `.flowboard/flowboard.toml`
//! 2. `FLOWBOARD_*` environment variables
//! 3. CLI arguments

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{FailurePolicy, Scope, SessionConfig};

pub const FLOWBOARD_DIR: &str = ".flowboard";
pub const CONFIG_FILE: &str = "flowboard.toml";

pub const ENV_BASE_URL: &str = "FLOWBOARD_BASE_URL";
pub const ENV_PROJECT: &str = "FLOWBOARD_PROJECT";
pub const ENV_DISCIPLINE: &str = "FLOWBOARD_DISCIPLINE";
pub const ENV_LOG_FORMAT: &str = "FLOWBOARD_LOG_FORMAT";

const ENV_PREFIX: &str = "FLOWBOARD_";

/// Get the `.flowboard` directory for a project.
pub fn get_config_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(FLOWBOARD_DIR)
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(anyhow!(
                "Invalid log format '{}'. Valid values: compact, json",
                s
            )),
        }
    }
}

/// Board API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout for fetches and writes.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Which board to open.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScopeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline_id: Option<String>,
}

/// Sync engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// What to do with a move whose write failed: "retain" or "revert"
    #[serde(default)]
    pub on_write_failure: FailurePolicy,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_live_updates")]
    pub live_updates: bool,
}

fn default_event_buffer() -> usize {
    crate::sync::events::DEFAULT_EVENT_BUFFER
}

fn default_live_updates() -> bool {
    true
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            on_write_failure: FailurePolicy::default(),
            event_buffer: default_event_buffer(),
            live_updates: default_live_updates(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

/// The complete flowboard.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowboardToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub scope: ScopeSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FlowboardToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flowboard.toml")
    }

    /// Load `flowboard.toml` from `config_dir`, or defaults when it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize flowboard.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let url = self.server.base_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            warnings.push(format!(
                "server.base_url '{}' should start with http:// or https://",
                url
            ));
        }
        if self.server.request_timeout_secs == 0 {
            warnings.push("server.request_timeout_secs is 0; requests will fail immediately".into());
        }
        if self.sync.event_buffer == 0 {
            warnings.push("sync.event_buffer is 0; using 1".into());
        }
        for (key, value) in [
            ("scope.project_id", &self.scope.project_id),
            ("scope.discipline_id", &self.scope.discipline_id),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                warnings.push(format!("{} is set but empty", key));
            }
        }

        warnings
    }
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub base_url: Option<String>,
    pub project: Option<String>,
    pub discipline: Option<String>,
    pub verbose: bool,
}

/// Unified configuration that merges the file, environment and CLI layers.
#[derive(Debug, Clone)]
pub struct FlowboardConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: FlowboardToml,
    pub cli: CliOverrides,
    env: HashMap<String, String>,
}

impl FlowboardConfig {
    /// Load from a project directory, reading the process environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let env = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        Self::with_env(project_dir, env)
    }

    /// Load with an explicit environment snapshot.
    pub fn with_env(project_dir: PathBuf, env: HashMap<String, String>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = get_config_dir(&project_dir);
        let toml = FlowboardToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            cli: CliOverrides::default(),
            env,
        })
    }

    /// Create a FlowboardConfig with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, cli: CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli = cli;
        Ok(config)
    }

    /// Path to flowboard.toml.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Base URL of the board API (CLI → env → file).
    pub fn base_url(&self) -> String {
        self.cli
            .base_url
            .clone()
            .or_else(|| self.env_var(ENV_BASE_URL).map(String::from))
            .unwrap_or_else(|| self.toml.server.base_url.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.server.request_timeout_secs)
    }

    /// The board to open (CLI → env → file). Both ids are required.
    pub fn scope(&self) -> Result<Scope> {
        let project = self
            .cli
            .project
            .clone()
            .or_else(|| self.env_var(ENV_PROJECT).map(String::from))
            .or_else(|| self.toml.scope.project_id.clone())
            .ok_or_else(|| {
                anyhow!("No project selected. Pass --project, set {} or add [scope] project_id", ENV_PROJECT)
            })?;
        let discipline = self
            .cli
            .discipline
            .clone()
            .or_else(|| self.env_var(ENV_DISCIPLINE).map(String::from))
            .or_else(|| self.toml.scope.discipline_id.clone())
            .ok_or_else(|| {
                anyhow!(
                    "No discipline selected. Pass --discipline, set {} or add [scope] discipline_id",
                    ENV_DISCIPLINE
                )
            })?;
        Scope::new(project, discipline).context("Invalid board scope")
    }

    /// Log format (env → file). An unparseable env value falls back to the file.
    pub fn log_format(&self) -> LogFormat {
        self.env_var(ENV_LOG_FORMAT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.toml.logging.format)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            on_write_failure: self.toml.sync.on_write_failure,
            event_buffer: self.toml.sync.event_buffer.max(1),
            live_updates: self.toml.sync.live_updates,
        }
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
