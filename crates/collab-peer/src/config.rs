//! Peer configuration.
//!
//! Loaded from an optional JSON file; every field has a default, and CLI
//! flags override whatever the file says.

use collab_core::{ConnectionPolicy, IceConfig, RendezvousConfig, SessionConfig, TransportError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ROOM: &str = "collaborative-editor-room";
pub const DEFAULT_SIGNALING: &str = "wss://signaling.yjs.dev";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid rendezvous settings: {0}")]
    Rendezvous(#[from] TransportError),
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

fn default_signaling() -> Vec<String> {
    vec![DEFAULT_SIGNALING.to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".collab")
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_save_debounce_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    #[serde(default = "default_room")]
    pub room: String,

    #[serde(default = "default_signaling")]
    pub signaling: Vec<String>,

    #[serde(default)]
    pub ice_servers: IceConfig,

    /// Address to accept direct peer links on (e.g. `0.0.0.0:9000`).
    #[serde(default)]
    pub listen: Option<String>,

    /// Address other peers dial, if different from the bound one.
    #[serde(default)]
    pub advertise: Option<String>,

    /// Where the snapshot, history and saved content live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub color: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            room: default_room(),
            signaling: default_signaling(),
            ice_servers: IceConfig::default(),
            listen: None,
            advertise: None,
            data_dir: default_data_dir(),
            name: None,
            color: None,
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            save_debounce_ms: default_save_debounce_ms(),
        }
    }
}

impl PeerConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn rendezvous(&self) -> Result<RendezvousConfig, ConfigError> {
        let rendezvous = RendezvousConfig {
            room: self.room.clone(),
            signaling: self.signaling.clone(),
            ice: self.ice_servers.clone(),
        };
        rendezvous.validate()?;
        Ok(rendezvous)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            policy: ConnectionPolicy {
                max_retries: self.max_retries,
                retry_interval: Duration::from_millis(self.retry_interval_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            },
            save_debounce: Duration::from_millis(self.save_debounce_ms),
            ..SessionConfig::default()
        }
    }
}
