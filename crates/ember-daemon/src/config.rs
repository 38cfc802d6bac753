use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use ember_common::DaemonError;

/// Daemon configuration, loaded from a JSON file. A missing file falls back
/// to defaults with a warning; an unreadable or invalid file is fatal. The
/// control-plane credential can be overridden with `EMBER_API_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub api_url: String,
    pub api_key: String,
    pub poll_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub backup_interval_secs: u64,
    pub reap_interval_secs: u64,
    pub backup_dir: PathBuf,
    pub volumes_root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            api_key: String::new(),
            poll_interval_secs: 10,
            stats_interval_secs: 60,
            backup_interval_secs: 86_400,
            reap_interval_secs: 300,
            backup_dir: PathBuf::from("backups"),
            volumes_root: PathBuf::from("/var/lib/docker/volumes"),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::with_env_overrides(Self::default()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("reading {}: {e}", path.display())))?;
        let config: DaemonConfig = serde_json::from_str(&raw)
            .map_err(|e| DaemonError::Config(format!("parsing {}: {e}", path.display())))?;
        Ok(Self::with_env_overrides(config))
    }

    fn with_env_overrides(mut config: Self) -> Self {
        if let Ok(key) = std::env::var("EMBER_API_KEY") {
            config.api_key = key;
        }
        config
    }
}
