//! Client configuration management.
//!
//! Holds the gateway address, the refresh endpoint, the credential storage
//! backend and the last used username.
//!
//! Configuration is stored at `~/.config/smarttrade/config.json`. The
//! `SMARTTRADE_API_URL` environment variable overrides the gateway address.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::endpoints;
use crate::api::request::join_endpoint;
use crate::auth::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend, DEFAULT_CREDENTIALS_KEY};

/// Application name used for config/credential directory paths
const APP_NAME: &str = "smarttrade";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "SMARTTRADE_API_URL";

/// Gateway address used in development
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
/// 30s allows for slow gateway responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How often the external credential watcher polls the backend
const DEFAULT_SYNC_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
    pub storage_dir: Option<PathBuf>,
    pub credentials_key: String,
    pub sync_poll_interval_ms: u64,
    pub last_username: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_path: endpoints::auth::REFRESH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageKind::default(),
            storage_dir: None,
            credentials_key: DEFAULT_CREDENTIALS_KEY.to_string(),
            sync_poll_interval_ms: DEFAULT_SYNC_POLL_INTERVAL_MS,
            last_username: None,
        }
    }
}

impl ClientConfig {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&Self::config_path()?)?;
        Ok(config.with_api_url_override(std::env::var(API_URL_ENV).ok()))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Replace the gateway address when an override is present and non-empty
    pub fn with_api_url_override(mut self, value: Option<String>) -> Self {
        if let Some(url) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        self
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid API base URL '{}'", self.api_base_url))?;
        if url.cannot_be_a_base() {
            anyhow::bail!("API base URL '{}' cannot carry a path", self.api_base_url);
        }
        Ok(url)
    }

    /// Refresh endpoint under the gateway, keeping any base path prefix
    pub fn refresh_url(&self) -> Result<Url> {
        Ok(join_endpoint(&self.base_url()?, &self.refresh_path))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    /// Directory for file-backed credentials
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn open_backend(&self) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match self.storage {
            StorageKind::File => Arc::new(FileBackend::new(self.storage_dir()?)),
            StorageKind::Keyring => Arc::new(KeyringBackend::new()),
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Ok(backend)
    }
}
