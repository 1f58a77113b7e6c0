//! Periodic liveness pings on the heartbeat channels.
//!
//! The sender side only pings; a failed write retires the heartbeat link through
//! the link's writer task, which is the whole of the failure signal. The receiving
//! side stamps each ping's arrival in the directory. Neither side reconnects,
//! re-elects or removes anyone.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::codec::HEARTBEAT_PING;
use crate::directory::{ChannelRole, Directory, PeerId};

pub struct HeartbeatMonitor {
    directory: Arc<Directory>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(directory: Arc<Directory>, interval: Duration) -> Self {
        Self {
            directory,
            interval,
        }
    }

    /// Pings every peer each interval until `shutdown` flips or its sender goes away.
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.beat();
                }
            }
        }
        debug!("heartbeat monitor stopped");
    }

    /// Queues one ping on every usable heartbeat link and returns how many were queued.
    pub fn beat(&self) -> usize {
        let mut sent = 0;
        for (peer, link) in self.directory.outbound_links(ChannelRole::Heartbeat) {
            match link.send(HEARTBEAT_PING.to_vec()) {
                Ok(()) => sent += 1,
                Err(_) => debug!(%peer, "heartbeat link already closed"),
            }
        }
        sent
    }
}

/// Reads pings from an accepted heartbeat socket, recording each one.
///
/// Runs until the peer closes the connection. Silence is only reported: once a
/// peer has pinged at least once, a gap longer than `silence_limit` logs a single
/// warning, and the channel stays bound either way. Before the first ping nothing
/// is expected, since peers only start pinging once their own mesh is complete.
pub async fn read_pings<R>(
    mut reader: R,
    peer: PeerId,
    directory: Arc<Directory>,
    silence_limit: Duration,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut ping = *HEARTBEAT_PING;
    let mut heard = false;
    loop {
        let received = {
            // The read future survives the silence timer so a partial ping is never lost.
            let read = reader.read_exact(&mut ping);
            tokio::pin!(read);
            let mut reported = !heard;
            loop {
                tokio::select! {
                    result = &mut read => break result,
                    _ = tokio::time::sleep(silence_limit), if !reported => {
                        warn!(%peer, ?silence_limit, "peer stopped sending heartbeats");
                        reported = true;
                    }
                }
            }
        };

        match received {
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                info!(%peer, "peer closed its heartbeat channel");
                return Ok(());
            }
            Err(err) => return Err(err),
            Ok(_) => {
                if &ping != HEARTBEAT_PING {
                    debug!(%peer, "unexpected heartbeat payload");
                }
                heard = true;
                directory.record_heartbeat(&peer);
            }
        }
    }
}
