//! Configuration system for stager.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STAGER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/stager/config.toml
//!   3. ~/.config/stager/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StagerConfig {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub staging: StagingConfig,
    pub retry: RetryConfig,
    pub shaping: ShapingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port for the HTTP control API.
    pub api_port: u16,
    /// TCP port for incoming data-plane frames (tcp backend peers).
    pub data_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport backend: "posix", "tcp", or "mock". Selected at startup,
    /// not at compile time, so tests can swap in the mock.
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Chunk size in bytes each transfer task covers.
    pub chunk_size: u64,
    /// Workers spawned per node context.
    pub workers_per_node: u32,
    /// Node contexts registered at startup. Malleability events add and
    /// remove entries at runtime.
    pub nodes: Vec<String>,
    /// I/O block size used when streaming a chunk.
    pub io_block_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per block before a task fails terminally.
    pub max_attempts: u32,
    /// Linear backoff base: attempt N sleeps N * backoff_ms.
    pub backoff_ms: u64,
    /// Deadline for one remote frame acknowledgement.
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    /// Default per-request bandwidth limit in bytes/sec. 0 = unlimited.
    pub default_bytes_per_sec: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_port: 9201,
            data_port: 9202,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: "posix".to_string(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024 * 1024, // 64 MiB
            workers_per_node: 4,
            nodes: vec!["local".to_string()],
            io_block_size: 4 * 1024 * 1024, // 4 MiB, one wire frame
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
            rpc_timeout_ms: 5_000,
        }
    }
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            default_bytes_per_sec: 0,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("stager")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StagerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StagerConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STAGER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StagerConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply STAGER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STAGER_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("STAGER_NETWORK__DATA_PORT") {
            if let Ok(p) = v.parse() {
                self.network.data_port = p;
            }
        }
        if let Ok(v) = std::env::var("STAGER_TRANSPORT__BACKEND") {
            self.transport.backend = v;
        }
        if let Ok(v) = std::env::var("STAGER_STAGING__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.staging.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("STAGER_STAGING__WORKERS_PER_NODE") {
            if let Ok(n) = v.parse() {
                self.staging.workers_per_node = n;
            }
        }
        if let Ok(v) = std::env::var("STAGER_RETRY__MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
    }
}
