//! Configuration resolution for restream.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/restream/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a settings file only needs the keys it
//! changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default RTMP ingest base; the destination key is appended as a path segment.
pub const DEFAULT_INGEST_URL: &str = "rtmp://a.rtmp.youtube.com/live2";

/// Complete restream configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Directory uploaded videos are written to before relaying.
    pub upload_dir: PathBuf,
    /// Maximum accepted request body size for uploads.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
        }
    }
}

/// Relay process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path or name of the `ffmpeg` binary.
    pub ffmpeg_bin: PathBuf,
    /// Ingest base URL without the trailing key.
    pub ingest_url: String,
    /// Command placed in front of the relay binary (e.g. `["nice", "-n", "10"]`).
    pub launch_prefix: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            launch_prefix: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` must exist when given; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())
        .map_err(|e| Error::Config(format!("Invalid default configuration: {e}")))?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_json(&mut merged, load_config_value(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, load_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("restream").join("settings.json"))
}

fn load_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively merge `overlay` into `base`; objects merge per key, anything
/// else replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `RESTREAM_*` overrides. `lookup` resolves a variable name.
///
/// Unparsable numeric or address values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("RESTREAM_ADDR").and_then(|v| v.parse().ok()) {
        config.server.listen_addr = addr;
    }
    if let Some(dir) = lookup("RESTREAM_UPLOAD_DIR") {
        config.server.upload_dir = PathBuf::from(dir);
    }
    if let Some(n) = lookup("RESTREAM_MAX_UPLOAD_BYTES").and_then(|v| v.parse().ok()) {
        config.server.max_upload_bytes = n;
    }
    if let Some(bin) = lookup("RESTREAM_FFMPEG_BIN") {
        config.relay.ffmpeg_bin = PathBuf::from(bin);
    }
    if let Some(url) = lookup("RESTREAM_INGEST_URL") {
        config.relay.ingest_url = url;
    }
    if let Some(level) = lookup("RESTREAM_LOG_LEVEL") {
        config.log.level = level;
    }
}
