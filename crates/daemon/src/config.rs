// Daemon configuration.
//
// File: `~/.chatlog/config.toml` (or `chatlogd --config <path>`).
// Environment overrides: CHATLOG_LISTEN_ADDR, CHATLOG_DB_PATH, CHATLOG_LOG_FILTER.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chatlog_common::path::normalize_prefix;
use serde::{Deserialize, Serialize};

/// Root directory for chatlog global state: `~/.chatlog/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".chatlog"))
}

/// Path to the default config file: `~/.chatlog/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Path to the default message database: `~/.chatlog/messages.db`.
pub fn default_db_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("messages.db"))
}

// ── Daemon config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// HTTP listen address (host:port).
    pub listen_addr: String,
    /// SQLite database location. Defaults to `~/.chatlog/messages.db`.
    pub db_path: Option<PathBuf>,
    /// Tracing filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub sync: SyncConfig,
    pub github: GithubConfig,
    pub targets: Vec<TargetConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".into(),
            db_path: None,
            log_filter: "info".into(),
            sync: SyncConfig::default(),
            github: GithubConfig::default(),
            targets: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load the config an operator asked for.
    ///
    /// An explicit path must exist. Without one, `~/.chatlog/config.toml` is
    /// used when present and defaults otherwise. Environment overrides are
    /// applied and the result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::load_from(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::load_from(&path)?,
                None => Self::default(),
            },
        };

        let config = config.with_env_overrides(|key| std::env::var(key));
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific path without overrides or validation.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Apply environment overrides through a lookup function (testable).
    pub fn with_env_overrides<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Ok(addr) = env("CHATLOG_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(path) = env("CHATLOG_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Ok(filter) = env("CHATLOG_LOG_FILTER") {
            self.log_filter = filter;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("at least one [[targets]] entry is required".into()));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Invalid("target name must not be empty".into()));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name `{}`",
                    target.name
                )));
            }
            if target.owner.trim().is_empty() || target.repo.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` needs both owner and repo",
                    target.name
                )));
            }
            if target.branch.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` has an empty branch",
                    target.name
                )));
            }
            if let Err(error) = normalize_prefix(&target.path_prefix) {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` has an invalid path_prefix: {error}",
                    target.name
                )));
            }
        }

        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("sync.batch_size must be at least 1".into()));
        }
        if self.sync.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid("sync.unhealthy_threshold must be at least 1".into()));
        }
        if self.sync.sweep_interval_sec == 0 {
            return Err(ConfigError::Invalid("sync.sweep_interval_sec must be at least 1".into()));
        }
        if self.sync.commit_timeout_sec == 0 {
            return Err(ConfigError::Invalid("sync.commit_timeout_sec must be at least 1".into()));
        }

        self.listen_socket_addr().map(|_| ())
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!("listen_addr `{}` is not host:port", self.listen_addr))
        })
    }

    /// Database path, falling back to `~/.chatlog/messages.db`, then `./messages.db`.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .or_else(default_db_path)
            .unwrap_or_else(|| PathBuf::from("messages.db"))
    }
}

/// Sweep and batching options shared by every target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Maximum messages per commit.
    pub batch_size: usize,
    /// Background sweep cadence.
    pub sweep_interval_sec: u64,
    pub commit_strategy: CommitStrategy,
    /// Consecutive failed runs before a target counts as unhealthy.
    pub unhealthy_threshold: u32,
    /// Upper bound on a single remote commit call.
    pub commit_timeout_sec: u64,
    /// Nudge the scheduler after every accepted message.
    pub sync_on_append: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            sweep_interval_sec: 300,
            commit_strategy: CommitStrategy::OneFilePerMessage,
            unhealthy_threshold: 3,
            commit_timeout_sec: 30,
            sync_on_append: true,
        }
    }
}

/// How a batch is laid out in the remote repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommitStrategy {
    /// `{prefix}/{timestamp}_{id}.txt` per message.
    #[default]
    OneFilePerMessage,
    /// `{prefix}/messages_{min}_{max}.jsonl` per batch.
    AggregatedFile,
}

/// GitHub API settings. The token itself lives in the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GithubConfig {
    pub api_url: String,
    /// Name of the environment variable holding the access token.
    pub token_env: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self { api_url: "https://api.github.com".into(), token_env: "GITHUB_TOKEN".into() }
    }
}

/// One remote destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_branch() -> String {
    "main".into()
}

fn default_path_prefix() -> String {
    "messages".into()
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}
