//! On-disk configuration: a JSON file named on the command line via `--config`.
//!
//! Shaped after `calimero-network-core`'s `chat-p0c::config::Config` (load/save pair, a
//! generated-if-absent identity field) but swapped to this crate's `serde_json` + `thiserror`
//! stack rather than `toml` + `eyre`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
}

/// `replica: 0` means "generate one and persist it" — handled by [`Config::load`], never seen by
/// the rest of the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub replica: i64,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    pub basepath: PathBuf,
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_fsync_interval")]
    pub fsync_interval_secs: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_fsync_interval() -> u64 {
    10
}

fn default_sync_interval() -> u64 {
    60
}

const REPLICA_ID_FILE: &str = "replica_id";

impl Config {
    /// Loads `path`, generating and persisting a replica id alongside it (in a sibling
    /// `replica_id` file under `basepath`) if the config specifies `replica: 0`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_json::from_str(&content)?;
        if config.replica == 0 {
            config.replica = Self::load_or_generate_replica_id(&config.basepath)?;
        }
        Ok(config)
    }

    fn load_or_generate_replica_id(basepath: &Path) -> Result<i64, ConfigError> {
        let path = basepath.join(REPLICA_ID_FILE);
        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(id) = existing.trim().parse::<i64>() {
                return Ok(id);
            }
        }
        let generated = (rand::random::<u64>() & !(1u64 << 63)) as i64;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(&path, generated.to_string()).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(generated)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_zero_triggers_generation_and_persists() {
        let dir = std::env::temp_dir().join(format!("cfg-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.json");
        std::fs::write(
            &config_path,
            format!(r#"{{"replica":0,"peers":[],"basepath":{:?}}}"#, dir),
        )
        .unwrap();

        let first = Config::load(&config_path).unwrap();
        assert_ne!(first.replica, 0);

        let second = Config::load(&config_path).unwrap();
        assert_eq!(first.replica, second.replica, "replica id must persist across loads");
    }

    #[test]
    fn explicit_replica_id_is_kept_as_is() {
        let dir = std::env::temp_dir().join(format!("cfg-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.json");
        std::fs::write(
            &config_path,
            format!(r#"{{"replica":42,"peers":[],"basepath":{:?}}}"#, dir),
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.replica, 42);
    }
}
