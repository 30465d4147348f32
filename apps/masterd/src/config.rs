//! Master daemon configuration.
//!
//! Stored as TOML; loaded from the path given on the command line, or from
//! `~/.config/packmule/masterd.toml` (created with defaults if missing).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// On-disk daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port for the allocation service.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Storage node WebSocket addresses, selected round-robin.
    #[serde(default)]
    pub storage_nodes: Vec<String>,

    /// Shared secret for minting upload tokens. Must match the storage
    /// nodes' configuration.
    #[serde(default)]
    pub token_secret: String,
}

fn default_port() -> u16 {
    7410
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_nodes: Vec::new(),
            token_secret: String::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or from the default location
    /// (creating it with defaults if absent).
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                Ok(toml::from_str(&content)?)
            }
            None => {
                let path = default_config_path();
                if path.exists() {
                    let content = std::fs::read_to_string(&path)?;
                    Ok(toml::from_str(&content)?)
                } else {
                    let config = Config::default();
                    config.save(&path)?;
                    Ok(config)
                }
            }
        }
    }

    /// Saves the configuration to disk.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the default configuration file path.
fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("packmule")
        .join("masterd.toml")
}
