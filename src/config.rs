//! Configuration management for Stash Server

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Name of the transient chunk directory under the storage root
pub const CHUNKS_DIR: &str = "chunks";

/// Name of the final-file directory under the storage root
pub const FILES_DIR: &str = "files";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body, in bytes
    pub max_body_bytes: usize,
}

/// Where uploads live and how they are addressed publicly.
///
/// Shared read-only by every upload component; nothing reaches for these
/// paths through globals.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// How many recently merged sessions to remember for late chunk arrivals
    pub recent_completions: usize,
    /// Fall back to a full sidecar scan when the dedup index misses
    pub dedup_rescan_on_miss: bool,
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    /// Path of `path` relative to the storage root, always `/`-separated.
    ///
    /// Returns `None` when `path` is not under the root.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Public URL for a storage-root-relative path.
    pub fn public_url(&self, relative: &str) -> String {
        let encoded: Vec<String> = relative
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            encoded.join("/")
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                max_body_bytes: 50 * 1024 * 1024,
            },
            storage: StorageConfig::new("./uploads", "http://localhost:8080/uploads"),
            upload: UploadConfig {
                recent_completions: 1024,
                dedup_rescan_on_miss: true,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
                max_body_bytes: parse_var("MAX_BODY_BYTES", defaults.server.max_body_bytes)?,
            },
            storage: StorageConfig {
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .unwrap_or(defaults.storage.public_base_url),
            },
            upload: UploadConfig {
                recent_completions: parse_var(
                    "RECENT_COMPLETIONS",
                    defaults.upload.recent_completions,
                )?,
                dedup_rescan_on_miss: parse_var(
                    "DEDUP_RESCAN_ON_MISS",
                    defaults.upload.dedup_rescan_on_miss,
                )?,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
