//! Ring leader election in the Chang-Roberts style.
//!
//! Each node sends its own priority to its ring successor. A node forwards any
//! probe carrying a higher priority than its own, drops lower ones, and decides
//! it is the leader when its own probe comes back around. Only the probe of the
//! global maximum survives a full lap, so exactly one node reaches
//! [`ElectionState::Decided`]. Unique priorities are enforced when the [`Ring`]
//! is built; nothing here tries to cope with duplicates.

use std::cmp::Ordering;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::directory::{ChannelRole, Directory, PeerId, Priority};
use crate::ring::{Ring, RingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Electing,
    Decided { leader: PeerId },
}

/// What the node must do after processing an election event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAction {
    Forward { priority: Priority, to: PeerId },
    Drop,
    Elected,
}

pub struct ElectionEngine {
    local: PeerId,
    own: Priority,
    successor: PeerId,
    state: watch::Sender<ElectionState>,
}

impl ElectionEngine {
    pub fn new(local: impl Into<PeerId>, ring: &Ring) -> Result<Self, RingError> {
        let local = local.into();
        let own = ring.priority_of(&local)?;
        let successor = ring.successor_of(&local)?.to_string();
        let (state, _) = watch::channel(ElectionState::Idle);

        Ok(Self {
            local,
            own,
            successor,
            state,
        })
    }

    pub fn own_priority(&self) -> Priority {
        self.own
    }

    pub fn successor(&self) -> &str {
        &self.successor
    }

    pub fn state(&self) -> ElectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        matches!(&*self.state.borrow(), ElectionState::Decided { leader } if *leader == self.local)
    }

    /// Starts an election by probing the successor with our own priority.
    ///
    /// Calling this again while electing re-sends the probe; once decided it is a no-op.
    pub fn initiate(&self) -> ProbeAction {
        let mut action = ProbeAction::Drop;
        self.state.send_if_modified(|state| match state {
            ElectionState::Decided { .. } => false,
            _ if self.successor == self.local => {
                // Sole member of the ring.
                *state = ElectionState::Decided {
                    leader: self.local.clone(),
                };
                action = ProbeAction::Elected;
                true
            }
            ElectionState::Idle => {
                *state = ElectionState::Electing;
                action = self.forward(self.own);
                true
            }
            ElectionState::Electing => {
                action = self.forward(self.own);
                false
            }
        });
        action
    }

    /// Applies the forwarding rule to a probe received from the ring predecessor.
    pub fn on_probe(&self, priority: Priority) -> ProbeAction {
        let mut action = ProbeAction::Drop;
        self.state.send_if_modified(|state| {
            if matches!(state, ElectionState::Decided { .. }) {
                return false;
            }

            match priority.cmp(&self.own) {
                Ordering::Equal => {
                    *state = ElectionState::Decided {
                        leader: self.local.clone(),
                    };
                    action = ProbeAction::Elected;
                    true
                }
                Ordering::Greater => {
                    action = self.forward(priority);
                    let was_idle = *state == ElectionState::Idle;
                    *state = ElectionState::Electing;
                    was_idle
                }
                Ordering::Less => false,
            }
        });
        action
    }

    /// [`ElectionEngine::initiate`] plus sending the resulting probe.
    pub fn start(&self, directory: &Directory) {
        info!(priority = self.own, successor = %self.successor, "starting leader election");
        let action = self.initiate();
        self.dispatch(action, directory);
    }

    /// [`ElectionEngine::on_probe`] plus sending the resulting probe, if any.
    pub fn handle_probe(&self, priority: Priority, directory: &Directory) {
        let action = self.on_probe(priority);
        self.dispatch(action, directory);
    }

    fn forward(&self, priority: Priority) -> ProbeAction {
        ProbeAction::Forward {
            priority,
            to: self.successor.clone(),
        }
    }

    fn dispatch(&self, action: ProbeAction, directory: &Directory) {
        match action {
            ProbeAction::Forward { priority, to } => {
                let slot = match (Frame::LeaderElection { priority }).encode() {
                    Ok(slot) => slot,
                    Err(err) => {
                        warn!(priority, error = %err, "cannot encode election probe");
                        return;
                    }
                };
                match directory.outbound(&to, ChannelRole::Data) {
                    Ok(Some(link)) => {
                        if link.send(slot).is_err() {
                            warn!(successor = %to, priority, "successor link closed, probe lost");
                        } else {
                            debug!(successor = %to, priority, "forwarded election probe");
                        }
                    }
                    Ok(None) => {
                        warn!(successor = %to, priority, "successor has no usable data link, probe lost")
                    }
                    Err(err) => warn!(error = %err, "cannot route election probe"),
                }
            }
            ProbeAction::Elected => {
                info!(leader = %self.local, priority = self.own, "elected cluster leader");
            }
            ProbeAction::Drop => debug!(own = self.own, "election probe dropped"),
        }
    }
}
