//! Relay configuration and persisted state files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::registry::RelayRegistry;

/// Seconds a node may stay silent before the relay forgets it.
pub const DEFAULT_CLEAR_TIME: f64 = 0.5;

/// Errors loading or saving relay files.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("State file {0} not found and no config file was given")]
    MissingState(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fresh relay's settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub port: u16,
    /// Where the state snapshot is written. Nothing is persisted when unset.
    #[serde(default)]
    pub save_location: Option<PathBuf>,
    #[serde(default = "default_clear_time")]
    pub clear_time: f64,
}

fn default_clear_time() -> f64 {
    DEFAULT_CLEAR_TIME
}

impl RelayConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            save_location: None,
            clear_time: DEFAULT_CLEAR_TIME,
        }
    }

    /// Load a config file.
    pub fn from_config(path: &Path) -> Result<Self, RelayError> {
        info!("Loading new relay from config file {}", path.display());
        read_json(path)
    }
}

/// Everything a relay persists: its settings plus the registry and the
/// alternate relays it has heard of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayState {
    pub port: u16,
    #[serde(default)]
    pub save_location: Option<PathBuf>,
    #[serde(default)]
    pub peers: RelayRegistry,
    #[serde(default)]
    pub altservers: Vec<String>,
    #[serde(default = "default_clear_time")]
    pub clear_time: f64,
}

impl From<RelayConfig> for RelayState {
    fn from(config: RelayConfig) -> Self {
        Self {
            port: config.port,
            save_location: config.save_location,
            peers: RelayRegistry::new(),
            altservers: Vec::new(),
            clear_time: config.clear_time,
        }
    }
}

impl RelayState {
    /// Load a saved snapshot, or start fresh from `config` when the snapshot
    /// does not exist yet.
    pub fn from_state(path: &Path, config: Option<&Path>) -> Result<Self, RelayError> {
        if path.exists() {
            info!("Loading saved relay from state file {}", path.display());
            return read_json(path);
        }
        match config {
            Some(config) => {
                warn!(
                    "No state file found at {}, loading new instance from config file {}",
                    path.display(),
                    config.display()
                );
                Ok(RelayConfig::from_config(config)?.into())
            }
            None => Err(RelayError::MissingState(path.to_path_buf())),
        }
    }

    /// Write the snapshot to `save_location`, if one is configured.
    pub async fn save(&self) -> Result<(), RelayError> {
        let Some(path) = &self.save_location else {
            return Ok(());
        };
        let json = serde_json::to_string(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| RelayError::Write {
                path: path.clone(),
                source,
            })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RelayError> {
    let data = std::fs::read_to_string(path).map_err(|source| RelayError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| RelayError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"port": 8000}"#).unwrap();

        let config = RelayConfig::from_config(&path).unwrap();
        assert_eq!(config, RelayConfig::new(8000));
    }

    #[test]
    fn test_state_falls_back_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relay.json");
        std::fs::write(
            &config_path,
            r#"{"port": 8001, "save_location": null, "clear_time": 2.0}"#,
        )
        .unwrap();

        let state = RelayState::from_state(&dir.path().join("missing.json"), Some(&config_path))
            .unwrap();
        assert_eq!(state.port, 8001);
        assert_eq!(state.clear_time, 2.0);
        assert!(state.peers.is_empty());
    }

    #[test]
    fn test_state_missing_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayState::from_state(&dir.path().join("missing.json"), None).unwrap_err();
        assert!(matches!(err, RelayError::MissingState(_)));
    }

    #[test]
    fn test_unparseable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            RelayConfig::from_config(&path),
            Err(RelayError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = RelayState::from(RelayConfig {
            port: 8002,
            save_location: Some(path.clone()),
            clear_time: 1.5,
        });
        state.peers.ping("lab", "a", 100.0);
        state.altservers = vec!["http://10.0.0.9:8000".into()];
        state.save().await.unwrap();

        let loaded = RelayState::from_state(&path, None).unwrap();
        assert_eq!(loaded, state);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["altservers"].is_array());
        assert!(raw["peers"]["lab"]["a"]["buffer"].is_object());
    }

    #[tokio::test]
    async fn test_save_without_location_is_noop() {
        let state = RelayState::from(RelayConfig::new(8003));
        state.save().await.unwrap();
    }
}
