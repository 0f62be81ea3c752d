use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::block::{ClientId, ServerId};
use crate::threshold::Params;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let shown = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: shown.clone(), source })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: shown, source })
}

/// Fixed at process start and shared read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub server_id: ServerId,
    pub listen_addr: SocketAddr,
    /// Peer id to base url, e.g. `2 -> "http://10.0.0.2:2510"`. Excludes self.
    pub peers: BTreeMap<ServerId, String>,
    pub server_count: u64,
    pub client_count: u64,
    pub threshold: u64,
    pub tick_interval_ms: u64,
    pub tx_batch_size: usize,
    pub pending_pool_limit: usize,
    pub tx_per_tick: usize,
    pub dkg_seed: String,
    /// Hide headers from pulls until the block body has reached every peer.
    pub block_sync: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 2510)),
            peers: BTreeMap::new(),
            server_count: 1,
            client_count: 1,
            threshold: 1,
            tick_interval_ms: 100,
            tx_batch_size: 64,
            pending_pool_limit: 256,
            tx_per_tick: 128,
            dkg_seed: String::from("tallychain"),
            block_sync: true,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        if self.server_count == 0 || self.client_count == 0 {
            return invalid("server and client counts must be positive".into());
        }
        if !(1..=self.server_count).contains(&self.server_id) {
            return invalid(format!("server id {} outside 1..={}", self.server_id, self.server_count));
        }
        if self.threshold != self.client_count {
            return invalid(format!(
                "threshold {} must equal client count {}",
                self.threshold, self.client_count
            ));
        }
        if self.client_count > u32::MAX as u64 {
            return invalid("too many clients".into());
        }
        for peer in self.peers.keys() {
            if *peer == self.server_id || !(1..=self.server_count).contains(peer) {
                return invalid(format!("bad peer id {}", peer));
            }
        }
        if self.peers.len() as u64 != self.server_count - 1 {
            return invalid(format!(
                "{} peers configured for {} servers",
                self.peers.len(),
                self.server_count
            ));
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick interval must be positive".into());
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn params(&self) -> Params {
        Params { t: self.threshold as u32, n: self.client_count as u32 }
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.peers.keys().copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id: ClientId,
    /// Base urls of the servers this client pulls from and votes to.
    pub servers: Vec<String>,
    pub client_count: u64,
    pub tick_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: 1,
            servers: vec![String::from("http://127.0.0.1:2510")],
            client_count: 1,
            tick_interval_ms: 100,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".into()));
        }
        if !(1..=self.client_count).contains(&self.client_id) {
            return Err(ConfigError::Invalid(format!(
                "client id {} outside 1..={}",
                self.client_id, self.client_count
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick interval must be positive".into()));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn params(&self) -> Params {
        Params::unanimous(self.client_count as u32)
    }
}
