//! Configuration module for pingtrail.
//!
//! Process settings come from environment variables with sensible defaults;
//! the monitoring setup itself (`AppConfig`) is a JSON document on disk.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::PingTarget;

/// Smallest accepted probe interval.
pub const MIN_INTERVAL_MS: u64 = 100;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the command/event API (default: 8080)
    pub http_port: u16,
    /// Directory for the daily probe logs (default: "logs")
    pub log_dir: PathBuf,
    /// Path of the persisted AppConfig JSON (default: "pingtrail.json")
    pub config_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_dir: PathBuf::from("logs"),
            config_path: PathBuf::from("pingtrail.json"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PINGTRAIL_LOG_DIR`: log directory (default: "logs")
    /// - `PINGTRAIL_CONFIG_PATH`: config file (default: "pingtrail.json")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PINGTRAIL_HTTP_PORT") {
            match port_str.parse() {
                Ok(port) => cfg.http_port = port,
                Err(_) => tracing::warn!("Ignoring invalid PINGTRAIL_HTTP_PORT {:?}", port_str),
            }
        }

        if let Ok(log_dir) = env::var("PINGTRAIL_LOG_DIR") {
            cfg.log_dir = PathBuf::from(log_dir);
        }

        if let Ok(config_path) = env::var("PINGTRAIL_CONFIG_PATH") {
            cfg.config_path = PathBuf::from(config_path);
        }

        cfg
    }
}

/// Config error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist config {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Format(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The user-facing monitoring setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub targets: Vec<PingTarget>,
    pub ping_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_history_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            targets: PingTarget::defaults(),
            ping_interval_ms: 1000,
            timeout_ms: 5000,
            max_history_size: 100,
        }
    }
}

impl AppConfig {
    /// Read the config at `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the config atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let persist_err = |source| ConfigError::Persist {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }

        let tmp = path.with_extension("json.tmp");
        let written = fs::File::create(&tmp)
            .and_then(|mut file| file.write_all(&json).and_then(|_| file.sync_all()))
            .and_then(|_| fs::rename(&tmp, path));

        if let Err(source) = written {
            if let Err(e) = fs::remove_file(&tmp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {:?}: {}", tmp, e);
                }
            }
            return Err(persist_err(source));
        }

        Ok(())
    }

    /// Check the scalar settings. Target addresses are checked by the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval_ms < MIN_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "ping_interval_ms must be at least {}",
                MIN_INTERVAL_MS
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}
