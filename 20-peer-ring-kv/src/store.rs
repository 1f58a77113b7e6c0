//! In-memory key-value map replicated to every peer.
//!
//! Local writes apply synchronously, then fan out one frame per peer data link.
//! Replication is one hop and best effort: a peer applies what it receives and
//! never re-broadcasts it, and nobody acknowledges or retries. Concurrent writes
//! to the same key resolve by arrival order on each node, so nodes can disagree
//! after racing writers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::codec::{CodecError, Frame};
use crate::directory::{ChannelRole, Directory};

pub struct ReplicatedStore {
    data: Mutex<BTreeMap<String, String>>,
    directory: Arc<Directory>,
}

impl ReplicatedStore {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            directory,
        }
    }

    /// Stores `key -> value` locally and queues a Write frame for every peer.
    ///
    /// Fails only when the pair cannot fit in a data frame, in which case the
    /// local map is left untouched. Success says nothing about delivery.
    pub fn put(&self, key: String, value: String) -> Result<(), CodecError> {
        let slot = Frame::Write {
            key: key.clone(),
            value: value.clone(),
        }
        .encode()?;

        // The queue hand-off happens under the map lock so every peer sees local
        // writes in the order they were applied here.
        let mut data = self.data();
        data.insert(key, value);
        self.replicate(slot);
        Ok(())
    }

    /// Removes `key` if present and queues a Delete frame for every peer.
    pub fn delete(&self, key: &str) -> Result<(), CodecError> {
        let slot = Frame::Delete {
            key: key.to_string(),
        }
        .encode()?;

        let mut data = self.data();
        data.remove(key);
        self.replicate(slot);
        Ok(())
    }

    /// Local read. Never touches the network.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data().get(key).cloned()
    }

    /// Applies a mutation received from a peer without replicating it further.
    ///
    /// Returns `false` for frames that are not store mutations.
    pub fn apply_remote(&self, frame: Frame) -> bool {
        match frame {
            Frame::Write { key, value } => {
                debug!(%key, "applying replicated write");
                self.data().insert(key, value);
                true
            }
            Frame::Delete { key } => {
                debug!(%key, "applying replicated delete");
                self.data().remove(&key);
                true
            }
            Frame::LeaderElection { .. } => false,
        }
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data().clone()
    }

    fn replicate(&self, slot: Vec<u8>) {
        for (peer, link) in self.directory.outbound_links(ChannelRole::Data) {
            if link.send(slot.clone()).is_err() {
                debug!(%peer, "data link closed, replication skipped");
            }
        }
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
