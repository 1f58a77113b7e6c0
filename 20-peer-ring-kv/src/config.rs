//! Cluster configuration loaded from YAML at startup.
//!
//! ```yaml
//! peers:
//!   alpha: ["127.0.0.1:7001", "127.0.0.1:8001"]   # [heartbeat, data]
//!   beta:  ["127.0.0.1:7002", "127.0.0.1:8002"]
//! rest:
//!   alpha: "127.0.0.1:9001"
//!   beta:  "127.0.0.1:9002"
//! priorities:
//!   alpha: 0
//!   beta: 1
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::codec::{encode_handshake, CodecError};
use crate::directory::{PeerId, PeerInfo, Priority};
use crate::ring::{Ring, RingError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config")]
    Parse(#[from] serde_yaml::Error),
    #[error("cluster has no peers")]
    NoPeers,
    #[error("peer {0:?} must list exactly two addresses: [heartbeat, data]")]
    PeerAddresses(PeerId),
    #[error("peer id {id:?} does not fit in a handshake")]
    PeerIdTooLong {
        id: PeerId,
        #[source]
        source: CodecError,
    },
    #[error("peer {0:?} is not in the cluster configuration")]
    UnknownPeer(PeerId),
    #[error("no REST address configured for {0:?}")]
    MissingRestAddress(PeerId),
    #[error("priorities must be given for every peer; {0:?} has none")]
    MissingPriority(PeerId),
    #[error("election requested but no ring priorities are configured")]
    NoPriorities,
    #[error("peer {id:?} was started with priority {given} but is configured with {configured}")]
    PriorityMismatch {
        id: PeerId,
        given: Priority,
        configured: Priority,
    },
    #[error(transparent)]
    Ring(#[from] RingError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Peer id -> `[heartbeat address, data address]`.
    pub peers: BTreeMap<PeerId, Vec<String>>,
    /// Peer id -> HTTP bind address.
    #[serde(default)]
    pub rest: BTreeMap<PeerId, String>,
    /// Peer id -> ring priority. Leave empty to run without elections.
    #[serde(default)]
    pub priorities: BTreeMap<PeerId, Priority>,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_dial_retry_interval")]
    pub dial_retry_interval_ms: u64,
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
    /// Deadline for a single socket write.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_heartbeat_interval() -> u64 {
    3000
}
fn default_dial_retry_interval() -> u64 {
    2000
}
fn default_dial_attempts() -> u32 {
    15
}
fn default_io_timeout() -> u64 {
    5000
}
fn default_handshake_timeout() -> u64 {
    5000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            dial_retry_interval_ms: default_dial_retry_interval(),
            dial_attempts: default_dial_attempts(),
            io_timeout_ms: default_io_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Gap after which a peer that has pinged before is reported silent: three missed pings.
    pub fn heartbeat_silence_limit(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    pub fn dial_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dial_retry_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Upper bound on the whole connect phase: every dial retry plus one handshake.
    pub fn connect_deadline(&self) -> Duration {
        self.dial_retry_interval() * self.dial_attempts.max(1) + self.handshake_timeout()
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        if let Some((id, _)) = self.peers.iter().find(|(_, addrs)| addrs.len() != 2) {
            return Err(ConfigError::PeerAddresses(id.clone()));
        }
        for id in self.peers.keys() {
            encode_handshake(id).map_err(|source| ConfigError::PeerIdTooLong {
                id: id.clone(),
                source,
            })?;
        }
        if let Some(id) = self.priorities.keys().find(|id| !self.peers.contains_key(*id)) {
            return Err(ConfigError::UnknownPeer(id.clone()));
        }
        if self.has_priorities() {
            if let Some(id) = self.peers.keys().find(|id| !self.priorities.contains_key(*id)) {
                return Err(ConfigError::MissingPriority(id.clone()));
            }
            self.ring()?;
        }
        Ok(())
    }

    /// Ensures `id` can run as a node of this cluster.
    pub fn check_local(&self, id: &str) -> Result<(), ConfigError> {
        if !self.peers.contains_key(id) {
            return Err(ConfigError::UnknownPeer(id.to_string()));
        }
        Ok(())
    }

    pub fn rest_addr(&self, id: &str) -> Result<&str, ConfigError> {
        self.rest
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingRestAddress(id.to_string()))
    }

    pub fn has_priorities(&self) -> bool {
        !self.priorities.is_empty()
    }

    /// Checks a priority supplied on the command line against the configured one.
    pub fn check_priority(&self, id: &str, given: Priority) -> Result<(), ConfigError> {
        match self.priorities.get(id) {
            None if self.has_priorities() => Err(ConfigError::MissingPriority(id.to_string())),
            None => Err(ConfigError::NoPriorities),
            Some(&configured) if configured != given => Err(ConfigError::PriorityMismatch {
                id: id.to_string(),
                given,
                configured,
            }),
            Some(_) => Ok(()),
        }
    }

    pub fn ring(&self) -> Result<Ring, ConfigError> {
        if !self.has_priorities() {
            return Err(ConfigError::NoPriorities);
        }
        Ok(Ring::new(
            self.priorities.iter().map(|(id, p)| (id.clone(), *p)),
        )?)
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(id, addrs)| PeerInfo {
                id: id.clone(),
                heartbeat_addr: addrs[0].clone(),
                data_addr: addrs[1].clone(),
                priority: self.priorities.get(id).copied(),
            })
            .collect()
    }
}
