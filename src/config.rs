use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{GreetError, Result};
use crate::rpc::TCP_ADDR;

pub const CONFIG_DIR: &str = "clickgreet";
pub const CONFIG_FILE: &str = "config.json";

/// Where the broker listens and how clients reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// TCP address the broker binds.
    pub listen_addr: String,
    /// When set, clients connect over TCP to this address instead of the
    /// local socket.
    pub connect_addr: Option<String>,
    #[cfg(unix)]
    pub unix_path: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: TCP_ADDR.to_string(),
            connect_addr: None,
            #[cfg(unix)]
            unix_path: PathBuf::from(crate::rpc::UNIX_PATH),
        }
    }
}

/// Element ids on the page and the actor the click handler talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub input_id: String,
    pub trigger_id: String,
    pub output_id: String,
    pub actor: String,
    pub method: String,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            input_id: "name".into(),
            trigger_id: "clickMeBtn".into(),
            output_id: "greeting".into(),
            actor: "storage".into(),
            method: "greet".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub page: PageConfig,
}

impl Config {
    /// `$CONFIG_DIR/clickgreet/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load the config file if there is one, then apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                log::debug!("No config at {path:?}, using defaults");
                Self::default()
            }
            None => {
                log::warn!("Could not determine config directory, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| GreetError::config(format!("failed to read {path:?}: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| GreetError::config(format!("invalid JSON in {path:?}: {e}")))
    }

    /// `BROKER_ADDR`, `BROKER_LISTEN` and `BROKER_SOCKET` override the file.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("BROKER_ADDR") {
            self.broker.connect_addr = Some(addr);
        }
        if let Some(addr) = var("BROKER_LISTEN") {
            self.broker.listen_addr = addr;
        }
        #[cfg(unix)]
        {
            if let Some(path) = var("BROKER_SOCKET") {
                self.broker.unix_path = PathBuf::from(path);
            }
        }
    }
}
