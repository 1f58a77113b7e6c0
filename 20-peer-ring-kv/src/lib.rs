//! A fixed cluster of peers that replicate an in-memory key-value map and elect a
//! leader on a priority ring.
//!
//! Each node keeps two TCP channels per peer and direction: a data channel for
//! replicated writes and election probes, and a heartbeat channel for liveness
//! pings.
//!
//! - [`codec`]: wire frames and handshakes.
//! - [`directory`]: per-peer link table.
//! - [`link`]: ordered outbound sockets.
//! - [`connection`]: dialing, accepting and inbound readers.
//! - [`store`]: the replicated map.
//! - [`heartbeat`]: liveness pings.
//! - [`ring`] and [`election`]: ring order and leader election.
//! - [`node`]: startup and shutdown.
//! - [`config`], [`cli`] and [`http`]: the outer surfaces.

pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod election;
pub mod heartbeat;
pub mod http;
pub mod link;
pub mod node;
pub mod ring;
pub mod store;
