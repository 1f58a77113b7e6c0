//! Unidirectional election ring derived from configured priorities.

use thiserror::Error;

use crate::directory::{PeerId, Priority};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring has no members")]
    Empty,
    #[error("priority {priority} is shared by {first:?} and {second:?}; ring priorities must be unique")]
    DuplicatePriority {
        priority: Priority,
        first: PeerId,
        second: PeerId,
    },
    #[error("peer {0:?} is not on the ring")]
    UnknownPeer(PeerId),
}

/// Members ordered by ascending priority; each member's successor is the next
/// entry, and the highest priority wraps around to the lowest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    members: Vec<(Priority, PeerId)>,
}

impl Ring {
    pub fn new<I>(members: I) -> Result<Self, RingError>
    where
        I: IntoIterator<Item = (PeerId, Priority)>,
    {
        let mut members: Vec<_> = members
            .into_iter()
            .map(|(id, priority)| (priority, id))
            .collect();
        if members.is_empty() {
            return Err(RingError::Empty);
        }
        members.sort();

        if let Some(pair) = members.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(RingError::DuplicatePriority {
                priority: pair[0].0,
                first: pair[0].1.clone(),
                second: pair[1].1.clone(),
            });
        }

        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn priority_of(&self, id: &str) -> Result<Priority, RingError> {
        self.position(id).map(|at| self.members[at].0)
    }

    pub fn successor_of(&self, id: &str) -> Result<&str, RingError> {
        let at = self.position(id)?;
        Ok(&self.members[(at + 1) % self.members.len()].1)
    }

    /// Peer holding the given priority, if any.
    pub fn peer_with(&self, priority: Priority) -> Option<&str> {
        self.members
            .binary_search_by_key(&priority, |(p, _)| *p)
            .ok()
            .map(|at| self.members[at].1.as_str())
    }

    /// The member every correct election must pick.
    pub fn highest(&self) -> (&str, Priority) {
        let (priority, id) = &self.members[self.members.len() - 1];
        (id, *priority)
    }

    fn position(&self, id: &str) -> Result<usize, RingError> {
        self.members
            .iter()
            .position(|(_, member)| member == id)
            .ok_or_else(|| RingError::UnknownPeer(id.to_string()))
    }
}
