// Client configuration: JSON file under the user's config dir, overridden by environment.

use anyhow::{anyhow, Context, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ReconnectPolicy;
use crate::stream::PageSizes;

pub const APP_DIR: &str = "studyroom";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_url: String,
    pub channel_url: String,
    pub initial_page_size: u32,
    pub older_page_size: u32,
    pub typing_idle_ms: u64,
    pub ack_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".to_string(),
            channel_url: "ws://localhost:5000/ws".to_string(),
            initial_page_size: 20,
            older_page_size: 10,
            typing_idle_ms: 1_000,
            ack_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            data_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn page_sizes(&self) -> PageSizes {
        PageSizes {
            initial: self.initial_page_size.max(1),
            older: self.older_page_size.max(1),
        }
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Where window state and credentials live.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Ok(dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join(APP_DIR))
    }

    /// Read `path` (missing file means defaults) and apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let parsed: ClientConfig = serde_json::from_str(&contents)
                .with_context(|| format!("parsing config {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            parsed
        } else {
            ClientConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(url) = lookup("STUDYROOM_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = lookup("STUDYROOM_CHANNEL_URL") {
            self.channel_url = url;
        }
        if let Some(dir) = lookup("STUDYROOM_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the default config location. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR);
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(config_dir()?.join("config.json"))
}
