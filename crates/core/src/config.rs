//! Configuration management for Votechain.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// How votes travel between the mirror and the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteRouting {
    /// The mirror is the sole vote record; the ledger carries elections and candidates.
    MirrorOnly,
    /// Every vote is submitted to the ledger, which is authoritative for counts.
    LedgerAnchored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mirror: MirrorConfig,
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// SQLite database file for the mirror
    pub path: PathBuf,
    /// Milliseconds to wait on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite database file for the local contract host
    pub path: PathBuf,
    /// Contract owner identity; also the identity admin transactions are sent as
    pub owner: String,
    /// Additional identities allowed to perform admin operations
    #[serde(default)]
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub routing: VoteRouting,
    /// Deadline for a single ledger call
    pub rpc_timeout_ms: u64,
    /// Attempts per ledger call, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Period of the background reconciliation loop (0 disables it)
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.owner.trim().is_empty() {
            return Err(ConfigError::Invalid("ledger.owner must not be empty".into()));
        }
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::Invalid("sync.max_attempts must be at least 1".into()));
        }
        if self.sync.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sync.rpc_timeout_ms must be positive".into()));
        }
        if self.sync.backoff_multiplier < 1.0 || !self.sync.backoff_multiplier.is_finite() {
            return Err(ConfigError::Invalid(
                "sync.backoff_multiplier must be a finite value >= 1.0".into(),
            ));
        }
        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "sync.initial_backoff_ms exceeds sync.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            mirror: MirrorConfig {
                path: PathBuf::from("data/mirror.db"),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            ledger: LedgerConfig {
                path: PathBuf::from("data/ledger.db"),
                owner: "authority".to_string(),
                admins: Vec::new(),
            },
            sync: SyncConfig {
                routing: VoteRouting::LedgerAnchored,
                rpc_timeout_ms: 10_000,
                max_attempts: 5,
                initial_backoff_ms: 200,
                max_backoff_ms: 5_000,
                backoff_multiplier: 2.0,
                reconcile_interval_secs: 60,
            },
            logging: LoggingConfig::default(),
        }
    }
}
