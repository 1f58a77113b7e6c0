use std::path::PathBuf;

use clap::Parser;

use crate::config::{ClusterConfig, ConfigError};
use crate::directory::{PeerId, Priority};
use crate::node::NodeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Identity of this node; must appear under `peers` in the config.
    #[arg(long)]
    pub id: PeerId,

    /// Ring priority of this node. Must match the configured priority.
    #[arg(long)]
    pub priority: Option<Priority>,

    /// Path to the cluster configuration.
    #[arg(long, default_value = "./config.yml")]
    pub config: PathBuf,

    /// Skip the leader election even when priorities are configured.
    #[arg(long)]
    pub no_election: bool,
}

impl Cli {
    /// Checks the command line against `cluster` and builds the node settings.
    pub fn node_config(self, cluster: ClusterConfig) -> Result<NodeConfig, ConfigError> {
        cluster.check_local(&self.id)?;
        if let Some(priority) = self.priority {
            cluster.check_priority(&self.id, priority)?;
        }
        Ok(NodeConfig {
            election: cluster.has_priorities() && !self.no_election,
            id: self.id,
            cluster,
        })
    }
}
