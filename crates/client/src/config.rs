// Client-side configuration.
//
// Loaded from `~/.cowrite/client.toml`; every field has a default so a
// missing or partial file still yields a usable config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root directory for Cowrite client state: `~/.cowrite/`.
pub fn client_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".cowrite"))
}

/// Path to the client config file: `~/.cowrite/client.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    client_dir().map(|d| d.join("client.toml"))
}

/// Default directory for per-room sqlite caches: `~/.cowrite/cache/`.
pub fn default_cache_dir() -> Option<PathBuf> {
    client_dir().map(|d| d.join("cache"))
}

/// Client configuration at `~/.cowrite/client.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay WebSocket base URL (e.g. `wss://relay.cowrite.dev`).
    pub relay_url: String,
    /// Backend HTTP base URL for tokens, snapshot URLs, and cell refs.
    pub backend_url: String,
    /// Override for the per-room cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Display name advertised through presence.
    pub display_name: Option<String>,
    /// Connection timing knobs.
    pub tuning: TuningConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://relay.cowrite.dev".into(),
            backend_url: "https://api.cowrite.dev".into(),
            cache_dir: None,
            display_name: None,
            tuning: TuningConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `~/.cowrite/client.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        default_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Cache directory to use: the configured override or the default
    /// under `~/.cowrite/cache/`, falling back to the system temp dir
    /// when no home directory can be determined.
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(default_cache_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("cowrite-cache"))
    }
}

/// Timing knobs for the connection lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TuningConfig {
    /// How long to wait for sync confirmation before going offline (ms).
    pub sync_confirm_timeout_ms: u64,
    /// Unsuccessful attempts on one connection before it is recreated.
    pub max_socket_attempts: u32,
    /// Full session recreations before giving up and staying offline.
    pub max_recreations: u32,
    /// Delay before the first retry on one connection (ms), doubling
    /// per subsequent attempt.
    pub attempt_backoff_base_ms: u64,
    /// Delay before the first session recreation (ms), doubling per
    /// subsequent recreation.
    pub recreation_backoff_base_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            sync_confirm_timeout_ms: 4_000,
            max_socket_attempts: 5,
            max_recreations: 3,
            attempt_backoff_base_ms: 500,
            recreation_backoff_base_ms: 2_000,
        }
    }
}

impl TuningConfig {
    pub fn sync_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_confirm_timeout_ms)
    }

    /// Pacing delay after `failed_attempts` consecutive failures on the
    /// current connection (doubling, exponent clamped).
    pub fn attempt_delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(6);
        Duration::from_millis(self.attempt_backoff_base_ms.saturating_mul(1 << exp))
    }

    /// Backoff before recreation number `recreation` (1-based): with the
    /// default base this is 2s, 4s, 8s.
    pub fn recreation_delay(&self, recreation: u32) -> Duration {
        let exp = recreation.saturating_sub(1).min(6);
        Duration::from_millis(self.recreation_backoff_base_ms.saturating_mul(1 << exp))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
