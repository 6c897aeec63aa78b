//! Configuration management for Stitch Server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upload::{DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MERGE_BUFFER_SIZE};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root of the chunk namespaces
    pub chunk_dir: PathBuf,
    /// Where merged artifacts are published
    pub output_dir: PathBuf,
    pub merge_buffer_size: usize,
    pub max_chunk_bytes: usize,
    pub cleanup_after_merge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "fs" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Idle time after which an unmerged namespace is deleted
    pub chunk_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl RetentionConfig {
    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7001,
            },
            storage: StorageConfig {
                backend: StorageBackend::Local,
                chunk_dir: PathBuf::from("./uploads/chunks"),
                output_dir: PathBuf::from("./uploads/files"),
                merge_buffer_size: DEFAULT_MERGE_BUFFER_SIZE,
                max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
                cleanup_after_merge: true,
            },
            retention: RetentionConfig {
                chunk_ttl_secs: 24 * 60 * 60,
                reap_interval_secs: 5 * 60,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var(&lookup, "SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                backend: parse_var(&lookup, "STORAGE_BACKEND", defaults.storage.backend)?,
                chunk_dir: lookup("CHUNK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.chunk_dir),
                output_dir: lookup("OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.output_dir),
                merge_buffer_size: parse_var(
                    &lookup,
                    "MERGE_BUFFER_SIZE",
                    defaults.storage.merge_buffer_size,
                )?,
                max_chunk_bytes: parse_var(&lookup, "MAX_CHUNK_BYTES", defaults.storage.max_chunk_bytes)?,
                cleanup_after_merge: parse_var(
                    &lookup,
                    "CLEANUP_AFTER_MERGE",
                    defaults.storage.cleanup_after_merge,
                )?,
            },
            retention: RetentionConfig {
                chunk_ttl_secs: parse_var(&lookup, "CHUNK_TTL_SECS", defaults.retention.chunk_ttl_secs)?,
                reap_interval_secs: parse_var(
                    &lookup,
                    "REAP_INTERVAL_SECS",
                    defaults.retention.reap_interval_secs,
                )?,
            },
        };

        if config.storage.merge_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                name: "MERGE_BUFFER_SIZE",
                value: "0".to_string(),
            });
        }
        if config.storage.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CHUNK_BYTES",
                value: "0".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
