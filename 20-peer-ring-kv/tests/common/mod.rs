//! Shared harness: real nodes on ephemeral localhost ports.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::try_join_all;
use peer_ring_kv::config::{ClusterConfig, TimingConfig};
use peer_ring_kv::node::{self, Listeners, NodeConfig, NodeHandle};

/// Short intervals so liveness and retries show up within a test.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_interval_ms: 100,
        dial_retry_interval_ms: 50,
        dial_attempts: 60,
        io_timeout_ms: 1000,
        handshake_timeout_ms: 1000,
    }
}

pub struct TestCluster {
    pub nodes: Vec<NodeHandle>,
}

impl TestCluster {
    /// Starts one node per `(id, priority)` pair, all at once, and returns once
    /// every node reports itself ready.
    pub async fn start(members: &[(&str, u64)], election: bool) -> Result<Self> {
        Self::start_staggered(members, election, None).await
    }

    /// Like [`TestCluster::start`], but `late` waits before starting its node.
    /// Every listener is bound up front, so early nodes reach it immediately.
    pub async fn start_staggered(
        members: &[(&str, u64)],
        election: bool,
        late: Option<(&str, Duration)>,
    ) -> Result<Self> {
        let mut listeners = Vec::new();
        let mut peers = BTreeMap::new();
        for (id, _) in members {
            let bound = Listeners::bind("127.0.0.1:0", "127.0.0.1:0").await?;
            peers.insert(
                id.to_string(),
                vec![
                    bound.heartbeat.local_addr()?.to_string(),
                    bound.data.local_addr()?.to_string(),
                ],
            );
            listeners.push(bound);
        }

        let cluster = ClusterConfig {
            peers,
            rest: BTreeMap::new(),
            priorities: members
                .iter()
                .map(|(id, priority)| (id.to_string(), *priority))
                .collect(),
            timing: fast_timing(),
        };
        cluster.validate()?;

        let starts = members.iter().zip(listeners).map(|((id, _), bound)| {
            let config = NodeConfig {
                id: id.to_string(),
                cluster: cluster.clone(),
                election,
            };
            let delay = late
                .filter(|(late_id, _)| late_id == id)
                .map(|(_, delay)| delay);
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                node::start_with_listeners(config, bound).await
            }
        });
        let nodes = tokio::time::timeout(Duration::from_secs(10), try_join_all(starts)).await??;
        Ok(Self { nodes })
    }

    pub fn node(&self, id: &str) -> &NodeHandle {
        self.nodes
            .iter()
            .find(|node| node.id() == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let polled = tokio::time::timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if polled.is_err() {
        bail!("condition not met within {limit:?}");
    }
    Ok(())
}
