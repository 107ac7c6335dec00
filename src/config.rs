//! Layered daemon configuration: compiled defaults → TOML file → environment
//! variables (`FOLDER_MCP_*`) → CLI flags. See `SPEC_FULL.md` §3 / spec.md
//! §6 ("Environment").

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_debounce_ms")]
    pub watch_debounce_ms: u64,
    #[serde(default = "default_batch_size")]
    pub watch_batch_size: usize,
    #[serde(default = "default_broadcast_rate")]
    pub broadcast_rate_per_sec: u32,
    #[serde(default = "default_broadcast_debounce_ms")]
    pub broadcast_debounce_ms: u64,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_ws_port() -> u16 {
    8765
}
fn default_http_port() -> u16 {
    8080
}
fn default_debounce_ms() -> u64 {
    crate::watcher::DEFAULT_DEBOUNCE_MS
}
fn default_batch_size() -> usize {
    crate::watcher::DEFAULT_BATCH_SIZE
}
fn default_broadcast_rate() -> u32 {
    5
}
fn default_broadcast_debounce_ms() -> u64 {
    300
}
fn default_model() -> String {
    "minilm".to_string()
}
fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(8)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            http_port: default_http_port(),
            watch_debounce_ms: default_debounce_ms(),
            watch_batch_size: default_batch_size(),
            broadcast_rate_per_sec: default_broadcast_rate(),
            broadcast_debounce_ms: default_broadcast_debounce_ms(),
            default_model: default_model(),
            supported_models: vec!["minilm".to_string(), "mpnet".to_string()],
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl DaemonConfig {
    /// Layer precedence, lowest to highest: compiled defaults, an optional
    /// TOML file, `FOLDER_MCP_*` environment variables, explicit CLI
    /// overrides applied last by the caller via the `with_*` setters.
    pub fn load(toml_path: Option<&std::path::Path>) -> Self {
        let mut config = Self::default();

        if let Some(path) = toml_path {
            if let Ok(text) = std::fs::read_to_string(path) {
                match toml::from_str::<DaemonConfig>(&text) {
                    Ok(from_file) => config = from_file,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config file");
                    }
                }
            }
        }

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u16("FOLDER_MCP_WS_PORT") {
            self.ws_port = v;
        }
        if let Some(v) = env_u16("FOLDER_MCP_HTTP_PORT") {
            self.http_port = v;
        }
        if let Ok(v) = std::env::var("FOLDER_MCP_DEFAULT_MODEL") {
            self.default_model = v;
        }
        if let Some(v) = env_usize("FOLDER_MCP_WORKER_POOL_SIZE") {
            self.worker_pool_size = v;
        }
        if let Some(v) = env_u64("FOLDER_MCP_WATCH_DEBOUNCE_MS") {
            self.watch_debounce_ms = v;
        }
    }

    pub fn home_registry_path() -> PathBuf {
        home_dir().join(".folder-mcp").join("daemon.pid")
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.default_model, "minilm");
        assert!(config.supported_models.contains(&"minilm".to_string()));
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("FOLDER_MCP_DEFAULT_MODEL", "mpnet");
        let config = DaemonConfig::load(None);
        assert_eq!(config.default_model, "mpnet");
        std::env::remove_var("FOLDER_MCP_DEFAULT_MODEL");
    }
}
