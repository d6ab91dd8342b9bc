//! Configuration loading.
//!
//! Reads the notification-sync configuration file and applies environment
//! overrides. The bearer token is never part of the config; it always comes
//! from a [`TokenProvider`](crate::auth::TokenProvider).

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::backoff::BackoffPolicy;
use crate::constants;

/// Configuration for the notification sync engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// URL of the SignalR notifications hub (`http(s)://` or `ws(s)://`).
    pub hub_url: String,
    /// Base URL of the REST API serving notification history.
    pub api_base_url: String,
    /// Hub method invoked after connect to join the user's group.
    pub join_method: String,
    /// Hub event name carrying pushed notifications.
    pub receive_event: String,
    /// Maximum number of notifications held in the cache.
    pub capacity: usize,
    /// History page requested on initialize.
    pub history_page_index: u32,
    /// History page size requested on initialize.
    pub history_page_size: u32,
    /// Reconnect delays in milliseconds; the last entry repeats forever.
    pub reconnect_schedule_ms: Vec<u64>,
    /// Re-fetch the first history page after every successful reconnect.
    pub refresh_on_reconnect: bool,
    /// Seconds to wait for the hub handshake.
    pub handshake_timeout_secs: u64,
    /// Seconds to wait for a hub invocation to complete.
    pub invoke_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_url: constants::DEFAULT_HUB_URL.to_string(),
            api_base_url: constants::DEFAULT_API_BASE_URL.to_string(),
            join_method: constants::JOIN_METHOD.to_string(),
            receive_event: constants::RECEIVE_EVENT.to_string(),
            capacity: constants::DEFAULT_CAPACITY,
            history_page_index: constants::DEFAULT_HISTORY_PAGE_INDEX,
            history_page_size: constants::DEFAULT_HISTORY_PAGE_SIZE,
            reconnect_schedule_ms: constants::RECONNECT_SCHEDULE_MS.to_vec(),
            refresh_on_reconnect: false,
            handshake_timeout_secs: constants::HANDSHAKE_TIMEOUT.as_secs(),
            invoke_timeout_secs: constants::INVOKE_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `NOTIFY_SYNC_CONFIG_DIR` wins when set; otherwise the platform config
    /// dir (macOS: ~/Library/Application Support/notification-sync).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("NOTIFY_SYNC_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("notification-sync"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file is not an error: defaults are used instead.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`, falling back to defaults if absent.
    ///
    /// Fields missing from the file take their default values.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            log::debug!("[Config] No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(hub_url) = std::env::var("NOTIFY_SYNC_HUB_URL") {
            self.hub_url = hub_url;
        }

        if let Ok(api_url) = std::env::var("NOTIFY_SYNC_API_URL") {
            self.api_base_url = api_url;
        }

        if let Ok(capacity) = std::env::var("NOTIFY_SYNC_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                self.capacity = capacity;
            }
        }

        if let Ok(page_size) = std::env::var("NOTIFY_SYNC_PAGE_SIZE") {
            if let Ok(size) = page_size.parse::<u32>() {
                self.history_page_size = size;
            }
        }
    }

    /// Backoff policy built from `reconnect_schedule_ms`.
    ///
    /// An empty schedule falls back to the default one.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(&self.reconnect_schedule_ms).unwrap_or_default()
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Invocation timeout as a `Duration`.
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }
}
