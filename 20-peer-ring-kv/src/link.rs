//! Outbound half of a peer channel.
//!
//! A [`PeerLink`] is a cheap, cloneable handle on an ordered queue. A dedicated
//! writer task drains the queue into the socket, so callers never block on the
//! network and frames leave in exactly the order they were queued. When a write
//! fails or misses its deadline the writer retires the link in the directory and
//! exits; later sends then fail fast with [`LinkClosed`].

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::directory::{ChannelRole, Directory, PeerId};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("peer link is closed")]
pub struct LinkClosed;

#[derive(Debug, Clone)]
pub struct PeerLink {
    id: u64,
    queue: mpsc::UnboundedSender<Vec<u8>>,
}

impl PeerLink {
    /// Starts the writer task for `writer` and returns the handle feeding it.
    ///
    /// `directory` is only used to retire the link on failure; pass
    /// `Weak::new()` for a link that is not registered anywhere.
    pub fn spawn(
        peer: PeerId,
        role: ChannelRole,
        writer: BoxedWriter,
        directory: Weak<Directory>,
        write_timeout: Duration,
    ) -> Self {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (queue, frames) = mpsc::unbounded_channel();

        tokio::spawn(drain_queue(LinkWriter {
            id,
            peer,
            role,
            writer,
            directory,
            write_timeout,
            frames,
        }));

        Self { id, queue }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues one already-encoded frame.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), LinkClosed> {
        self.queue.send(frame).map_err(|_| LinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

struct LinkWriter {
    id: u64,
    peer: PeerId,
    role: ChannelRole,
    writer: BoxedWriter,
    directory: Weak<Directory>,
    write_timeout: Duration,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn drain_queue(mut link: LinkWriter) {
    while let Some(frame) = link.frames.recv().await {
        if let Err(err) = write_frame(&mut link.writer, &frame, link.write_timeout).await {
            warn!(peer = %link.peer, role = %link.role, error = %err, "peer link failed, retiring it");
            // Close our end before retiring so senders observe the failure right away.
            link.frames.close();
            if let Some(directory) = link.directory.upgrade() {
                directory.retire_outbound(&link.peer, link.role, link.id);
            }
            return;
        }
    }

    debug!(peer = %link.peer, role = %link.role, "peer link dropped, closing socket");
    if let Err(err) = link.writer.shutdown().await {
        debug!(peer = %link.peer, error = %err, "failed to shut down peer socket cleanly");
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8], deadline: Duration) -> io::Result<()> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    tokio::time::timeout(deadline, write)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"))?
}
