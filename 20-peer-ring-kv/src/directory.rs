//! Registry of every configured peer and the live channels bound to it.
//!
//! The directory is built once from configuration and only its socket fields
//! change afterwards: the connection manager attaches outbound links and inbound
//! readers, writer tasks retire links that failed, and the heartbeat reader stamps
//! liveness. All of it sits behind one mutex that is never held across I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::link::PeerLink;

/// Cluster-unique peer identity, assigned by configuration.
pub type PeerId = String;

/// Cluster-unique election rank.
pub type Priority = u64;

/// Which of the two per-peer channels a socket carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Data,
    Heartbeat,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Data => f.write_str("data"),
            ChannelRole::Heartbeat => f.write_str("heartbeat"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("unknown peer {0:?}")]
    UnknownPeer(PeerId),
    #[error("peer {0:?} is the local node and has no channels")]
    LocalPeer(PeerId),
    #[error("directory is closed")]
    Closed,
}

/// Static description of a peer, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub heartbeat_addr: String,
    pub data_addr: String,
    pub priority: Option<Priority>,
}

impl PeerInfo {
    pub fn address(&self, role: ChannelRole) -> &str {
        match role {
            ChannelRole::Data => &self.data_addr,
            ChannelRole::Heartbeat => &self.heartbeat_addr,
        }
    }
}

/// Handle on the task reading an accepted socket.
#[derive(Debug)]
pub struct InboundReader {
    task: AbortHandle,
}

impl InboundReader {
    pub fn new(task: AbortHandle) -> Self {
        Self { task }
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for InboundReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Point-in-time view of one peer's channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub id: PeerId,
    pub outbound_data: bool,
    pub outbound_heartbeat: bool,
    pub inbound_data: bool,
    pub inbound_heartbeat: bool,
    pub last_heartbeat: Option<Instant>,
}

impl PeerStatus {
    pub fn is_connected(&self) -> bool {
        self.outbound_data && self.outbound_heartbeat && self.inbound_data && self.inbound_heartbeat
    }
}

struct PeerEntry {
    info: PeerInfo,
    outbound_data: Option<PeerLink>,
    outbound_heartbeat: Option<PeerLink>,
    inbound_data: Option<InboundReader>,
    inbound_heartbeat: Option<InboundReader>,
    last_heartbeat: Option<Instant>,
}

impl PeerEntry {
    fn new(info: PeerInfo) -> Self {
        Self {
            info,
            outbound_data: None,
            outbound_heartbeat: None,
            inbound_data: None,
            inbound_heartbeat: None,
            last_heartbeat: None,
        }
    }

    fn outbound_mut(&mut self, role: ChannelRole) -> &mut Option<PeerLink> {
        match role {
            ChannelRole::Data => &mut self.outbound_data,
            ChannelRole::Heartbeat => &mut self.outbound_heartbeat,
        }
    }

    fn inbound_mut(&mut self, role: ChannelRole) -> &mut Option<InboundReader> {
        match role {
            ChannelRole::Data => &mut self.inbound_data,
            ChannelRole::Heartbeat => &mut self.inbound_heartbeat,
        }
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            id: self.info.id.clone(),
            outbound_data: self.outbound_data.is_some(),
            outbound_heartbeat: self.outbound_heartbeat.is_some(),
            inbound_data: self.inbound_data.as_ref().is_some_and(InboundReader::is_alive),
            inbound_heartbeat: self
                .inbound_heartbeat
                .as_ref()
                .is_some_and(InboundReader::is_alive),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

pub struct Directory {
    local: PeerId,
    peers: Mutex<BTreeMap<PeerId, PeerEntry>>,
    /// Set by `close_all` while holding the `peers` lock; attaches check it under the same lock.
    closed: AtomicBool,
    changed: Notify,
}

impl Directory {
    /// Builds the directory. `local` must be one of `peers`.
    pub fn new(local: impl Into<PeerId>, peers: Vec<PeerInfo>) -> Result<Self, PeerError> {
        let local = local.into();
        let peers: BTreeMap<_, _> = peers
            .into_iter()
            .map(|info| (info.id.clone(), PeerEntry::new(info)))
            .collect();
        if !peers.contains_key(&local) {
            return Err(PeerError::UnknownPeer(local));
        }

        Ok(Self {
            local,
            peers: Mutex::new(peers),
            closed: AtomicBool::new(false),
            changed: Notify::new(),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<PeerInfo, PeerError> {
        self.entries()
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| PeerError::UnknownPeer(id.to_string()))
    }

    /// Every configured peer except the local node.
    pub fn others(&self) -> Vec<PeerInfo> {
        self.entries()
            .values()
            .filter(|entry| entry.info.id != self.local)
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Installs a fresh outbound link, replacing (and thereby closing) any previous one.
    pub fn attach_outbound(
        &self,
        id: &str,
        role: ChannelRole,
        link: PeerLink,
    ) -> Result<(), PeerError> {
        self.update(id, |entry| *entry.outbound_mut(role) = Some(link))
    }

    /// Binds the reader of an accepted socket, aborting any reader it replaces.
    pub fn attach_inbound(
        &self,
        id: &str,
        role: ChannelRole,
        reader: InboundReader,
    ) -> Result<(), PeerError> {
        self.update(id, |entry| *entry.inbound_mut(role) = Some(reader))
    }

    pub fn outbound(&self, id: &str, role: ChannelRole) -> Result<Option<PeerLink>, PeerError> {
        let mut peers = self.entries();
        let entry = peers
            .get_mut(id)
            .ok_or_else(|| PeerError::UnknownPeer(id.to_string()))?;
        Ok(entry.outbound_mut(role).clone())
    }

    /// Usable outbound links of the given role, one per connected peer.
    pub fn outbound_links(&self, role: ChannelRole) -> Vec<(PeerId, PeerLink)> {
        self.entries()
            .values_mut()
            .filter_map(|entry| {
                let link = entry.outbound_mut(role).clone()?;
                Some((entry.info.id.clone(), link))
            })
            .collect()
    }

    /// Marks an outbound link unusable. Only the link identified by `link_id` is
    /// removed, so a replacement installed in the meantime survives.
    pub fn retire_outbound(&self, id: &str, role: ChannelRole, link_id: u64) -> bool {
        let retired = {
            let mut peers = self.entries();
            match peers.get_mut(id).map(|entry| entry.outbound_mut(role)) {
                Some(slot) if slot.as_ref().is_some_and(|link| link.id() == link_id) => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };
        if retired {
            self.changed.notify_waiters();
        }
        retired
    }

    pub fn record_heartbeat(&self, id: &str) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.last_heartbeat = Some(Instant::now());
        }
    }

    /// Channel state of every peer except the local node.
    pub fn status(&self) -> Vec<PeerStatus> {
        self.entries()
            .values()
            .filter(|entry| entry.info.id != self.local)
            .map(PeerEntry::status)
            .collect()
    }

    /// True once every other peer has all four channels bound.
    pub fn is_fully_connected(&self) -> bool {
        self.status().iter().all(PeerStatus::is_connected)
    }

    /// Resolves once [`Directory::is_fully_connected`] holds.
    pub async fn wait_fully_connected(&self) {
        loop {
            let notified = self.changed.notified();
            if self.is_fully_connected() {
                return;
            }
            notified.await;
        }
    }

    /// Drops every link and aborts every inbound reader. Later attaches fail with
    /// [`PeerError::Closed`].
    pub fn close_all(&self) {
        let mut peers = self.entries();
        self.closed.store(true, Ordering::Release);
        for entry in peers.values_mut() {
            entry.outbound_data = None;
            entry.outbound_heartbeat = None;
            entry.inbound_data = None;
            entry.inbound_heartbeat = None;
        }
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut PeerEntry)) -> Result<(), PeerError> {
        if id == self.local {
            return Err(PeerError::LocalPeer(id.to_string()));
        }
        {
            let mut peers = self.entries();
            if self.closed.load(Ordering::Acquire) {
                return Err(PeerError::Closed);
            }
            let entry = peers
                .get_mut(id)
                .ok_or_else(|| PeerError::UnknownPeer(id.to_string()))?;
            apply(entry);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<PeerId, PeerEntry>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use super::*;

    pub(crate) fn info(id: &str, priority: Option<Priority>) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            heartbeat_addr: format!("{id}:hb"),
            data_addr: format!("{id}:data"),
            priority,
        }
    }

    pub(crate) fn trio() -> Vec<PeerInfo> {
        vec![
            info("alpha", Some(0)),
            info("beta", Some(1)),
            info("gamma", Some(2)),
        ]
    }

    fn sink_link(peer: &str, role: ChannelRole) -> PeerLink {
        PeerLink::spawn(
            peer.to_string(),
            role,
            Box::new(tokio::io::sink()),
            Weak::new(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn local_peer_must_be_configured() {
        let result = Directory::new("delta", trio());
        assert!(matches!(result, Err(PeerError::UnknownPeer(id)) if id == "delta"));
    }

    #[test]
    fn lookup_and_iteration_exclude_self() {
        let directory = Directory::new("alpha", trio()).expect("directory");

        let ids: Vec<_> = directory.others().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["beta".to_string(), "gamma".to_string()]);

        let beta = directory.get("beta").expect("beta");
        assert_eq!(beta.address(ChannelRole::Data), "beta:data");
        assert_eq!(beta.address(ChannelRole::Heartbeat), "beta:hb");
        assert_eq!(
            directory.get("omega"),
            Err(PeerError::UnknownPeer("omega".into()))
        );
    }

    #[tokio::test]
    async fn attaching_to_self_or_strangers_fails() {
        let directory = Directory::new("alpha", trio()).expect("directory");
        let result = directory.attach_outbound(
            "alpha",
            ChannelRole::Data,
            sink_link("alpha", ChannelRole::Data),
        );
        assert_eq!(result, Err(PeerError::LocalPeer("alpha".into())));

        let result = directory.attach_outbound(
            "omega",
            ChannelRole::Data,
            sink_link("omega", ChannelRole::Data),
        );
        assert_eq!(result, Err(PeerError::UnknownPeer("omega".into())));
    }

    #[tokio::test]
    async fn retire_only_removes_the_matching_link() {
        let directory = Directory::new("alpha", trio()).expect("directory");
        let first = sink_link("beta", ChannelRole::Data);
        let first_id = first.id();
        directory
            .attach_outbound("beta", ChannelRole::Data, first)
            .expect("attach");

        let replacement = sink_link("beta", ChannelRole::Data);
        let replacement_id = replacement.id();
        directory
            .attach_outbound("beta", ChannelRole::Data, replacement)
            .expect("attach replacement");

        assert!(!directory.retire_outbound("beta", ChannelRole::Data, first_id));
        assert_eq!(directory.outbound_links(ChannelRole::Data).len(), 1);

        assert!(directory.retire_outbound("beta", ChannelRole::Data, replacement_id));
        assert!(directory.outbound_links(ChannelRole::Data).is_empty());
        assert!(directory
            .outbound("beta", ChannelRole::Data)
            .expect("known peer")
            .is_none());
    }

    #[tokio::test]
    async fn fully_connected_needs_all_four_channels() {
        let directory = Directory::new("alpha", vec![info("alpha", None), info("beta", None)])
            .expect("directory");
        assert!(!directory.is_fully_connected());

        for role in [ChannelRole::Data, ChannelRole::Heartbeat] {
            directory
                .attach_outbound("beta", role, sink_link("beta", role))
                .expect("attach outbound");
            let reader = tokio::spawn(std::future::pending::<()>());
            directory
                .attach_inbound("beta", role, InboundReader::new(reader.abort_handle()))
                .expect("attach inbound");
        }

        tokio::time::timeout(Duration::from_secs(1), directory.wait_fully_connected())
            .await
            .expect("directory should report connected");

        directory.record_heartbeat("beta");
        let status = directory.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].is_connected());
        assert!(status[0].last_heartbeat.is_some());

        directory.close_all();
        assert!(!directory.is_fully_connected());
    }

    #[tokio::test]
    async fn attaching_after_close_aborts_the_reader() {
        let directory = Directory::new("alpha", trio()).expect("directory");
        directory.close_all();

        let reader = tokio::spawn(std::future::pending::<()>());
        let result = directory.attach_inbound(
            "beta",
            ChannelRole::Data,
            InboundReader::new(reader.abort_handle()),
        );
        assert_eq!(result, Err(PeerError::Closed));
        let joined = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("rejected reader should stop");
        assert!(joined.expect_err("reader was aborted").is_cancelled());

        let result = directory.attach_outbound(
            "beta",
            ChannelRole::Heartbeat,
            sink_link("beta", ChannelRole::Heartbeat),
        );
        assert_eq!(result, Err(PeerError::Closed));
        assert!(directory.outbound_links(ChannelRole::Heartbeat).is_empty());
    }
}
