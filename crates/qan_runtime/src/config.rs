//! Configuration management

use std::path::PathBuf;

use serde::Deserialize;

use crate::errors::{QanError, QanResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub db: DbConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub hostname: String,
    /// Base path prepended to client-facing URLs.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Where response files extracted from agent replies are stored.
    pub collect_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// SQLite database path.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Listen address for agent sessions, e.g. "0.0.0.0:9001".
    pub listen: String,
    /// Connections idle longer than this are reaped.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    /// Reaper period.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    /// Read deadline on agent data sessions.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Deadline for a command round-trip to an agent.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryConfig {
    /// Abstract-helper executable; tables-only classification when unset.
    pub helper_path: Option<PathBuf>,
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_max_idle_secs() -> u64 {
    20
}

fn default_refresh_secs() -> u64 {
    60
}

fn default_read_timeout_secs() -> u64 {
    20
}

fn default_send_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Load from a TOML file with a `QAND_`-prefixed environment overlay
    /// (e.g. `QAND_API__HOSTNAME` overrides `api.hostname`).
    pub fn load(path: &str) -> QanResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("QAND").separator("__"));

        let settings = builder.build().map_err(|e| QanError::Config {
            message: e.to_string(),
        })?;
        let config: Config = settings.try_deserialize().map_err(|e| QanError::Config {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QanResult<()> {
        if self.api.hostname.is_empty() {
            return Err(QanError::Config {
                message: "api.hostname cannot be empty".to_string(),
            });
        }
        if self.db.url.is_empty() {
            return Err(QanError::Config {
                message: "db.url cannot be empty".to_string(),
            });
        }
        if self.agent.listen.is_empty() {
            return Err(QanError::Config {
                message: "agent.listen cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}
