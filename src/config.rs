//! Configuration: file locations and tunables.
//!
//! # Purpose
//!
//! All tunables are plain scalars read once at startup from `render-link.json`.
//! Every field is optional; missing fields take the engine's stock defaults.
//!
//! # Locations
//!
//! Priority for the config directory:
//! 1. CLI `--config-dir`
//! 2. `RENDER_LINK_CONFIG_DIR` environment variable
//! 3. Current directory IF `render-link.json` exists there
//! 4. Platform config directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/render-link/{name}
//! - macOS: ~/Library/Application Support/render-link/{name}
//! - Windows: %APPDATA%\render-link\{name}

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rest::RestConfig;

pub const APP_DIR: &str = "render-link";
pub const CONFIG_FILE: &str = "render-link.json";
pub const CONFIG_DIR_ENV: &str = "RENDER_LINK_CONFIG_DIR";

/// Overrides for default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a file in the configuration directory
pub fn config_file(name: &str, paths: &PathConfig) -> PathBuf {
    config_dir(paths).join(name)
}

fn config_dir(paths: &PathConfig) -> PathBuf {
    if let Some(dir) = &paths.config_dir {
        return dir.clone();
    }

    if let Ok(current_dir) = std::env::current_dir() {
        if current_dir.join(CONFIG_FILE).exists() {
            return current_dir;
        }
    }

    if let Some(dir) = dirs_next::config_dir() {
        return dir.join(APP_DIR);
    }

    PathBuf::from(".")
}

/// Default location for relocated render outputs
pub fn default_output_dir() -> PathBuf {
    dirs_next::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("outputs")
}

/// Runtime tunables. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine_host: String,
    pub engine_port: u16,
    pub engine_version: String,
    pub listener_host: String,
    pub rest_timeout_ms: u64,
    pub rest_max_retries: u32,
    pub rest_retry_backoff_ms: u64,
    pub rest_throttle_ms: u64,
    pub load_timeout_ms: u64,
    pub debounce_ms: u64,
    /// Render deadline per job; 0 disables the watchdog
    pub render_timeout_ms: u64,
    pub drain_interval_ms: u64,
    pub output_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_host: "http://127.0.0.1".to_string(),
            engine_port: 41646,
            engine_version: "v1".to_string(),
            listener_host: "127.0.0.1".to_string(),
            rest_timeout_ms: 10_000,
            rest_max_retries: 3,
            rest_retry_backoff_ms: 250,
            rest_throttle_ms: 5,
            load_timeout_ms: 60_000,
            debounce_ms: 250,
            render_timeout_ms: 60_000,
            drain_interval_ms: 100,
            output_dir: None,
        }
    }
}

impl Config {
    /// Parse a config file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `render-link.json` from the resolved config dir, or defaults if absent
    pub fn load_or_default(paths: &PathConfig) -> Result<Self> {
        let path = config_file(CONFIG_FILE, paths);
        if path.exists() {
            Self::load(&path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// `{host}:{port}/{version}`
    pub fn engine_base(&self) -> String {
        format!(
            "{}:{}/{}",
            self.engine_host.trim_end_matches('/'),
            self.engine_port,
            self.engine_version
        )
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            timeout: Duration::from_millis(self.rest_timeout_ms),
            max_retries: self.rest_max_retries,
            retry_backoff: Duration::from_millis(self.rest_retry_backoff_ms),
            throttle: Duration::from_millis(self.rest_throttle_ms),
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn render_timeout(&self) -> Option<Duration> {
        (self.render_timeout_ms > 0).then(|| Duration::from_millis(self.render_timeout_ms))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }
}
