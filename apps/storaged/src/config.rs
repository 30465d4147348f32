//! Storage node daemon configuration.
//!
//! Stored as TOML; loaded from the path given on the command line, or from
//! `~/.config/packmule/storaged.toml` (created with defaults if missing).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use packmule_storage_node::StorageConfig;

/// On-disk daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port for the chunk stream service.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding blob files.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Emit a status record at least every N in-sequence chunks...
    #[serde(default = "default_status_every_chunks")]
    pub status_every_chunks: u32,

    /// ...or every this many milliseconds, whichever comes first.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    /// Sessions idle longer than this many seconds are evicted.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// How often the expiry sweeper runs, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Verify chunk checksums before persisting.
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Shared secret for validating upload tokens. Must match the master's
    /// configuration.
    #[serde(default)]
    pub token_secret: String,
}

fn default_port() -> u16 {
    7411
}

fn default_root() -> PathBuf {
    PathBuf::from("packmule-data")
}

fn default_status_every_chunks() -> u32 {
    8
}

fn default_status_interval_ms() -> u64 {
    500
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            root: default_root(),
            status_every_chunks: default_status_every_chunks(),
            status_interval_ms: default_status_interval_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            verify_checksums: true,
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

    /// Converts the daemon config into the library config.
    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig {
            port: self.port,
            root: self.root.clone(),
            status_every_chunks: self.status_every_chunks,
            status_interval: Duration::from_millis(self.status_interval_ms),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            verify_checksums: self.verify_checksums,
            token_secret: self.token_secret.clone(),
        }
    }
}

/// Returns the default configuration file path.
fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("packmule")
        .join("storaged.toml")
}
