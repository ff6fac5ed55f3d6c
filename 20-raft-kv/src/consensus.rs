//! The interface the replica consumes from its consensus module.
//!
//! Leader election, log replication and log persistence live behind this
//! trait. The replica only proposes commands, asks about leadership, and
//! drains the stream of committed entries.

use std::future::Future;

use crate::command::{Command, LogIndex, ReplicaId, Term};

/// Outcome of proposing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Index the command will occupy if it commits.
    pub index: LogIndex,
    /// Term in which it was proposed.
    pub term: Term,
    pub is_leader: bool,
}

/// One event on the committed-entry stream, delivered in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    Command { command: Command, index: LogIndex },
    /// Replace replica state wholesale with `data`, valid through `index`.
    Snapshot { data: Vec<u8>, index: LogIndex },
}

pub trait Consensus: Send + Sync + 'static {
    /// Proposes a command. Never blocks.
    fn start(&self, command: Command) -> Proposal;

    /// Current term and whether this replica believes it leads.
    fn state(&self) -> (Term, bool);

    fn term(&self) -> Term {
        self.state().0
    }

    fn is_leader(&self) -> bool {
        self.state().1
    }

    fn commit_index(&self) -> LogIndex;

    /// Best guess of the current leader.
    fn leader_id(&self) -> Option<ReplicaId>;

    /// Runs a round of communication with the other replicas and returns
    /// true if a newer leader exists or a majority could not be reached.
    fn check_if_deposed(&self) -> impl Future<Output = bool> + Send;

    /// Whether replay after a restart has finished and the current term has
    /// committed an entry of its own.
    fn is_restored(&self) -> bool;

    /// Installs a snapshot taken through `index` and discards the log prefix.
    fn snapshot(&self, index: LogIndex, data: Vec<u8>);

    /// Whether the retained log has grown past `threshold` bytes.
    fn needs_compaction(&self, threshold: usize) -> bool;

    /// Latest persisted snapshot, empty if none.
    fn read_snapshot(&self) -> Vec<u8>;

    /// Stops the module. The committed-entry stream closes afterwards.
    fn kill(&self);
}
