//! A whole replica group in one process: simulated consensus, one
//! [`KvServer`] per replica, and a shared in-process network for clerks.
//!
//! Used by the integration tests and by `raft-kv serve`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::client::{Clerk, ClerkConfig};
use crate::command::{LogIndex, ReplicaId, Term};
use crate::server::{KvServer, ServerConfig};
use crate::sim::{SimCluster, SimRaft};
use crate::transport::LocalTransport;

pub type LocalClerk = Clerk<LocalTransport<SimRaft>>;

/// One replica's row in [`LocalCluster::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub alive: bool,
    pub leader: bool,
    pub last_applied: LogIndex,
    pub keys: usize,
    pub snapshot_index: LogIndex,
    pub log_bytes: usize,
}

pub struct LocalCluster {
    sim: SimCluster,
    network: LocalTransport<SimRaft>,
    config: ServerConfig,
}

impl LocalCluster {
    /// Boots `n` replicas. No leader is chosen yet; call [`LocalCluster::elect`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(n: usize, config: ServerConfig) -> Result<Self> {
        if n == 0 {
            bail!("a cluster needs at least one replica");
        }
        let cluster = Self {
            sim: SimCluster::new(n),
            network: LocalTransport::new(n),
            config,
        };
        for id in 0..n {
            cluster.boot(id)?;
        }
        info!(
            replicas = n,
            max_raft_state = ?cluster.config.max_raft_state,
            "local cluster started"
        );
        Ok(cluster)
    }

    fn boot(&self, id: ReplicaId) -> Result<()> {
        let (raft, apply_rx) = self.sim.replica(id);
        let server = KvServer::start(id, raft, apply_rx, self.config.clone())
            .with_context(|| format!("failed to start replica {id}"))?;
        self.network.install(id, server);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sim.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sim.is_empty()
    }

    /// A clerk with its own random numbering of the replicas.
    pub fn clerk(&self) -> LocalClerk {
        Clerk::new(self.network.shuffled())
    }

    pub fn clerk_with(&self, config: ClerkConfig) -> LocalClerk {
        Clerk::with_config(self.network.shuffled(), config)
    }

    pub fn elect(&self, id: ReplicaId) -> Result<()> {
        if !self.sim.elect(id) {
            bail!("replica {id} cannot win an election right now");
        }
        Ok(())
    }

    /// Kills replica `id`. Its persisted snapshot survives for [`LocalCluster::restart`].
    pub fn crash(&self, id: ReplicaId) {
        if let Some(server) = self.network.remove(id) {
            server.kill();
        }
    }

    /// Crashes replica `id` if it is running, then boots it from its persister.
    pub fn restart(&self, id: ReplicaId) -> Result<()> {
        self.crash(id);
        self.boot(id)
    }

    /// Cuts `id` off from the other replicas and from clerks.
    pub fn disconnect(&self, id: ReplicaId) {
        self.sim.disconnect(id);
        self.network.set_reachable(id, false);
    }

    pub fn connect(&self, id: ReplicaId) {
        self.network.set_reachable(id, true);
        self.sim.connect(id);
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.network.set_unreliable(unreliable);
    }

    pub fn server(&self, id: ReplicaId) -> Option<Arc<KvServer<SimRaft>>> {
        self.network.server(id)
    }

    pub fn leader(&self) -> Option<ReplicaId> {
        self.sim.leader()
    }

    pub fn term(&self) -> Term {
        self.sim.term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.sim.commit_index()
    }

    pub fn log_size(&self, id: ReplicaId) -> usize {
        self.sim.log_size(id)
    }

    /// Lower-level handles for fault injection the methods above do not cover.
    pub fn sim(&self) -> &SimCluster {
        &self.sim
    }

    pub fn network(&self) -> &LocalTransport<SimRaft> {
        &self.network
    }

    pub fn status(&self) -> Vec<ReplicaStatus> {
        let leader = self.sim.leader();
        (0..self.len())
            .map(|id| {
                let server = self.server(id);
                ReplicaStatus {
                    id,
                    alive: server.as_ref().is_some_and(|s| !s.killed()),
                    leader: leader == Some(id),
                    last_applied: server.as_ref().map_or(0, |s| s.last_applied()),
                    keys: server.as_ref().map_or(0, |s| s.len()),
                    snapshot_index: self.sim.snapshot_index(id),
                    log_bytes: self.sim.log_size(id),
                }
            })
            .collect()
    }

    /// Kills every replica.
    pub fn shutdown(&self) {
        for id in 0..self.len() {
            self.crash(id);
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
