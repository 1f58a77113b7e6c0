//! Node bootstrap and lifecycle.
//!
//! Startup order: bind both channel listeners, start accepting, dial every peer,
//! wait until every peer has all four channels bound, start heartbeats, then
//! initiate the election. Any failure before the node is ready is fatal and is
//! returned to the caller. The returned [`NodeHandle`] owns the background tasks.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ClusterConfig, TimingConfig};
use crate::connection;
use crate::directory::{ChannelRole, Directory, PeerId, PeerStatus};
use crate::election::{ElectionEngine, ElectionState};
use crate::heartbeat::HeartbeatMonitor;
use crate::store::ReplicatedStore;

/// Everything a node needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: PeerId,
    pub cluster: ClusterConfig,
    /// Run the ring election after connecting. Requires configured priorities.
    pub election: bool,
}

/// Shared state reachable from every connection task.
pub struct NodeContext {
    pub directory: Arc<Directory>,
    pub store: Arc<ReplicatedStore>,
    pub election: Option<Arc<ElectionEngine>>,
    pub timing: TimingConfig,
    /// Flips to `true` once every outbound channel exists.
    pub ready: watch::Sender<bool>,
}

impl NodeContext {
    /// Waits until the node finished connecting to the mesh.
    pub async fn ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives in `self`, so this only returns once ready.
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

/// The two listeners peers dial into.
pub struct Listeners {
    pub heartbeat: TcpListener,
    pub data: TcpListener,
}

impl Listeners {
    pub async fn bind(heartbeat_addr: &str, data_addr: &str) -> Result<Self> {
        let heartbeat = TcpListener::bind(heartbeat_addr)
            .await
            .with_context(|| format!("cannot bind heartbeat listener on {heartbeat_addr}"))?;
        let data = TcpListener::bind(data_addr)
            .await
            .with_context(|| format!("cannot bind data listener on {data_addr}"))?;
        Ok(Self { heartbeat, data })
    }
}

/// Binds the listeners named in the configuration and starts the node.
pub async fn start(config: NodeConfig) -> Result<NodeHandle> {
    config.cluster.check_local(&config.id)?;
    let local = config
        .cluster
        .peer_infos()
        .into_iter()
        .find(|peer| peer.id == config.id)
        .ok_or_else(|| anyhow!("peer {} missing from configuration", config.id))?;
    let listeners = Listeners::bind(&local.heartbeat_addr, &local.data_addr).await?;
    start_with_listeners(config, listeners).await
}

/// Starts the node on already-bound listeners.
pub async fn start_with_listeners(config: NodeConfig, listeners: Listeners) -> Result<NodeHandle> {
    let NodeConfig {
        id,
        cluster,
        election,
    } = config;

    let directory = Arc::new(Directory::new(id.clone(), cluster.peer_infos())?);
    let election = if election {
        let ring = cluster.ring()?;
        Some(Arc::new(ElectionEngine::new(id.clone(), &ring)?))
    } else {
        None
    };
    let ctx = Arc::new(NodeContext {
        store: Arc::new(ReplicatedStore::new(Arc::clone(&directory))),
        directory,
        election,
        timing: cluster.timing.clone(),
        ready: watch::channel(false).0,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = NodeHandle {
        id,
        ctx: Arc::clone(&ctx),
        shutdown: shutdown_tx,
        tasks: Vec::new(),
    };
    handle.tasks.push(tokio::spawn(connection::accept_until(
        listeners.heartbeat,
        ChannelRole::Heartbeat,
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    handle.tasks.push(tokio::spawn(connection::accept_until(
        listeners.data,
        ChannelRole::Data,
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));

    if let Err(err) = connect_mesh(&ctx).await {
        handle.shutdown().await;
        return Err(err);
    }

    let monitor = HeartbeatMonitor::new(Arc::clone(&ctx.directory), ctx.timing.heartbeat_interval());
    handle.tasks.push(tokio::spawn(monitor.run_until(shutdown_rx)));

    ctx.ready.send_replace(true);
    if let Some(engine) = &ctx.election {
        engine.start(&ctx.directory);
    }

    info!(peer = %handle.id, "node ready");
    Ok(handle)
}

async fn connect_mesh(ctx: &Arc<NodeContext>) -> Result<()> {
    connection::dial_peers(ctx).await?;

    let deadline = ctx.timing.connect_deadline();
    tokio::time::timeout(deadline, ctx.directory.wait_fully_connected())
        .await
        .map_err(|_| {
            let missing: Vec<_> = ctx
                .directory
                .status()
                .into_iter()
                .filter(|status| !status.is_connected())
                .map(|status| status.id)
                .collect();
            anyhow!("peers {missing:?} did not connect back within {deadline:?}")
        })?;
    info!("all peer channels established");
    Ok(())
}

/// Handle on a running node.
pub struct NodeHandle {
    id: PeerId,
    ctx: Arc<NodeContext>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> Arc<ReplicatedStore> {
        Arc::clone(&self.ctx.store)
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.ctx.directory.status()
    }

    /// `None` when the node runs without elections.
    pub fn election_state(&self) -> Option<ElectionState> {
        self.ctx.election.as_ref().map(|engine| engine.state())
    }

    pub fn subscribe_election(&self) -> Option<watch::Receiver<ElectionState>> {
        self.ctx.election.as_ref().map(|engine| engine.subscribe())
    }

    /// Stops listeners and heartbeats, closes every peer socket and waits for the
    /// background tasks to finish.
    pub async fn shutdown(mut self) {
        // Nobody listening just means the tasks are already gone.
        let _ = self.shutdown.send(true);
        self.ctx.directory.close_all();

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "node task ended abnormally");
            }
        }
        info!(peer = %self.id, "node stopped");
    }
}
