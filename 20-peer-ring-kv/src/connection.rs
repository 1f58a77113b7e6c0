//! Builds the full mesh of heartbeat and data channels at startup.
//!
//! Outbound: every other peer is dialed on both of its addresses with a fixed
//! backoff and a bounded number of attempts, and each fresh socket immediately
//! carries a handshake naming the local peer. Inbound: each accepted socket must
//! open with a handshake naming a configured peer, after which it is bound into
//! that peer's directory entry and handed to a long-lived reader task. Nothing
//! here runs again after startup; a retired link stays retired.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{
    decode_handshake, read_slot, write_handshake, CodecError, Frame, DATA_SLOT, HANDSHAKE_SLOT,
};
use crate::directory::{ChannelRole, Directory, InboundReader, PeerError, PeerId, PeerInfo};
use crate::heartbeat;
use crate::link::PeerLink;
use crate::node::NodeContext;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake claims unknown peer {0:?}")]
    UnknownPeerHandshake(PeerId),
    #[error("unparsable handshake")]
    Codec(#[from] CodecError),
    #[error("connection closed before handshake")]
    Closed,
    #[error("no handshake within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Fixed-interval retry budget for dialing a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Dials the data and heartbeat channel of every other peer, concurrently.
///
/// Any channel that cannot be established within the retry budget fails the
/// whole call; the node cannot take part in a cluster it cannot fully reach.
pub async fn dial_peers(ctx: &Arc<NodeContext>) -> Result<()> {
    let peers = ctx.directory.others();
    let policy = RetryPolicy {
        attempts: ctx.timing.dial_attempts,
        backoff: ctx.timing.dial_retry_interval(),
    };

    let dials = peers.iter().flat_map(|peer| {
        [ChannelRole::Data, ChannelRole::Heartbeat].map(|role| dial_channel(ctx, peer, role, policy))
    });
    try_join_all(dials).await?;
    Ok(())
}

async fn dial_channel(
    ctx: &Arc<NodeContext>,
    peer: &PeerInfo,
    role: ChannelRole,
    policy: RetryPolicy,
) -> Result<()> {
    let addr = peer.address(role);
    let mut stream = connect_with_retry(addr, policy)
        .await
        .with_context(|| format!("cannot reach {} {role} channel at {addr}", peer.id))?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer.id, error = %err, "failed to set TCP_NODELAY");
    }

    tokio::time::timeout(
        ctx.timing.io_timeout(),
        write_handshake(&mut stream, ctx.directory.local_id()),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake write timed out"))
    .and_then(|written| written)
    .with_context(|| format!("failed to send handshake to {} {role} channel", peer.id))?;

    let link = PeerLink::spawn(
        peer.id.clone(),
        role,
        Box::new(stream),
        Arc::downgrade(&ctx.directory),
        ctx.timing.io_timeout(),
    );
    ctx.directory.attach_outbound(&peer.id, role, link)?;
    info!(peer = %peer.id, %role, %addr, "outbound channel established");
    Ok(())
}

/// Connects to `addr`, sleeping `policy.backoff` between failed attempts.
pub async fn connect_with_retry(addr: &str, policy: RetryPolicy) -> io::Result<TcpStream> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt < attempts => {
                debug!(%addr, attempt, error = %err, "dial failed, retrying");
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Accepts connections on one channel listener until shutdown.
pub async fn accept_until(
    listener: TcpListener,
    role: ChannelRole,
    ctx: Arc<NodeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => spawn_inbound(stream, remote, role, &ctx),
                Err(err) => warn!(%role, error = ?err, "failed to accept connection"),
            },
        }
    }
    debug!(%role, "listener stopped");
}

fn spawn_inbound(stream: TcpStream, remote: SocketAddr, role: ChannelRole, ctx: &Arc<NodeContext>) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        match bind_inbound(stream, role, ctx).await {
            Ok(()) => {}
            Err(HandshakeError::Peer(PeerError::Closed)) => {
                debug!(%remote, %role, "node shut down during handshake");
            }
            Err(err) => warn!(%remote, %role, error = %err, "dropping inbound connection"),
        }
    });
}

async fn bind_inbound(
    mut stream: TcpStream,
    role: ChannelRole,
    ctx: Arc<NodeContext>,
) -> Result<(), HandshakeError> {
    let peer = read_handshake(&mut stream, &ctx.directory, ctx.timing.handshake_timeout()).await?;

    let reader = match role {
        ChannelRole::Data => {
            let ctx = Arc::clone(&ctx);
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(err) = read_data_channel(stream, &peer, &ctx).await {
                    warn!(%peer, error = %err, "data channel read failed");
                }
            })
        }
        ChannelRole::Heartbeat => {
            let directory = Arc::clone(&ctx.directory);
            let silence_limit = ctx.timing.heartbeat_silence_limit();
            let peer = peer.clone();
            tokio::spawn(async move {
                let result =
                    heartbeat::read_pings(stream, peer.clone(), directory, silence_limit).await;
                if let Err(err) = result {
                    warn!(%peer, error = %err, "heartbeat channel read failed");
                }
            })
        }
    };

    ctx.directory
        .attach_inbound(&peer, role, InboundReader::new(reader.abort_handle()))?;
    info!(%peer, %role, "inbound channel bound");
    Ok(())
}

/// Reads the identity handshake and checks it names another configured peer.
pub async fn read_handshake<R>(
    reader: &mut R,
    directory: &Directory,
    deadline: Duration,
) -> Result<PeerId, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let slot = tokio::time::timeout(deadline, read_slot(reader, HANDSHAKE_SLOT))
        .await
        .map_err(|_| HandshakeError::TimedOut(deadline))??
        .ok_or(HandshakeError::Closed)?;
    let id = decode_handshake(&slot)?;

    if id == directory.local_id() || !directory.contains(&id) {
        return Err(HandshakeError::UnknownPeerHandshake(id));
    }
    Ok(id)
}

/// Applies every frame arriving from `peer` until the connection closes.
///
/// Writes and deletes go to the store; election probes are handled inline.
/// Malformed frames are logged and skipped.
pub async fn read_data_channel<R>(mut reader: R, peer: &str, ctx: &NodeContext) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(slot) = read_slot(&mut reader, DATA_SLOT).await? {
        match Frame::decode(&slot) {
            Ok(Frame::LeaderElection { priority }) => match &ctx.election {
                Some(engine) => {
                    // Forwarding needs our own outbound links, which may still be dialing.
                    ctx.ready().await;
                    engine.handle_probe(priority, &ctx.directory);
                }
                None => debug!(%peer, priority, "election disabled, ignoring probe"),
            },
            Ok(frame) => {
                ctx.store.apply_remote(frame);
            }
            Err(err) => warn!(%peer, error = %err, "dropping malformed frame"),
        }
    }
    info!(%peer, "peer closed its data channel");
    Ok(())
}
