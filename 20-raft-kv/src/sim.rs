//! In-process consensus module for tests and local clusters.
//!
//! `SimCluster` keeps one authoritative log for a fixed set of replicas and
//! hands each replica a [`SimRaft`] implementing [`Consensus`]. It does not
//! run an election protocol; the harness decides who leads with
//! [`SimCluster::elect`]. What it does model faithfully is what the
//! replica layer has to survive:
//!
//! - entries commit only while a majority is reachable, and proposals that
//!   never committed are dropped when a new term starts;
//! - a partitioned ex-leader keeps believing it leads until it reconnects;
//! - crashed replicas lose their in-memory state but keep their persister;
//! - each replica compacts on its own, and a replica whose next entry was
//!   compacted away is caught up with the freshest snapshot.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::command::{Command, LogIndex, ReplicaId, Term};
use crate::consensus::{ApplyMsg, Consensus, Proposal};

/// Fixed per-entry overhead counted on top of the encoded command.
const ENTRY_HEADER_LEN: usize = 8;

#[derive(Debug, Clone)]
struct Entry {
    term: Term,
    command: Command,
    size: usize,
}

/// Durable state that survives a replica crash.
#[derive(Debug, Clone, Default)]
struct Persister {
    snapshot: Vec<u8>,
    snapshot_index: LogIndex,
}

#[derive(Debug, Default)]
struct ReplicaSlot {
    alive: bool,
    connected: bool,
    /// Bumped on every crash and restart so stale handles see themselves dead.
    incarnation: u64,
    term: Term,
    believes_leader: bool,
    known_leader: Option<ReplicaId>,
    commit: LogIndex,
    commit_term: Term,
    delivered: LogIndex,
    apply_tx: Option<UnboundedSender<ApplyMsg>>,
    persister: Persister,
}

impl ReplicaSlot {
    fn reachable(&self) -> bool {
        self.alive && self.connected
    }
}

#[derive(Debug)]
struct ClusterState {
    term: Term,
    leader: Option<ReplicaId>,
    /// Index of the last compacted entry; `entries[0]` sits at `base + 1`.
    base: LogIndex,
    entries: Vec<Entry>,
    commit: LogIndex,
    commit_term: Term,
    replicas: Vec<ReplicaSlot>,
}

impl ClusterState {
    fn last_index(&self) -> LogIndex {
        self.base + self.entries.len() as LogIndex
    }

    fn entry(&self, index: LogIndex) -> &Entry {
        &self.entries[(index - self.base - 1) as usize]
    }

    fn has_majority(&self) -> bool {
        let reachable = self.replicas.iter().filter(|r| r.reachable()).count();
        reachable * 2 > self.replicas.len()
    }

    fn leader_reachable(&self) -> Option<ReplicaId> {
        self.leader.filter(|&id| self.replicas[id].reachable())
    }

    fn sync_slot(&mut self, id: ReplicaId) {
        let (term, leader, commit, commit_term) =
            (self.term, self.leader, self.commit, self.commit_term);
        let slot = &mut self.replicas[id];
        if !slot.reachable() {
            return;
        }
        slot.term = term;
        slot.known_leader = leader;
        slot.believes_leader = leader == Some(id);
        slot.commit = commit;
        slot.commit_term = commit_term;
    }

    fn try_commit(&mut self) {
        if self.leader_reachable().is_none() || !self.has_majority() {
            return;
        }
        let last = self.last_index();
        if last <= self.commit {
            return;
        }
        self.commit = last;
        self.commit_term = self.entry(last).term;
        debug!(commit = self.commit, term = self.commit_term, "entries committed");
        for id in 0..self.replicas.len() {
            self.sync_slot(id);
            self.deliver(id);
        }
    }

    /// Pushes everything committed and not yet delivered to `id`.
    fn deliver(&mut self, id: ReplicaId) {
        if !self.replicas[id].reachable() {
            return;
        }
        if self.replicas[id].delivered < self.base {
            let freshest = self
                .replicas
                .iter()
                .map(|r| &r.persister)
                .max_by_key(|p| p.snapshot_index)
                .cloned()
                .unwrap_or_default();
            debug!(
                replica = id,
                index = freshest.snapshot_index,
                "installing snapshot on lagging replica"
            );
            let slot = &mut self.replicas[id];
            slot.delivered = freshest.snapshot_index;
            if let Some(tx) = &slot.apply_tx {
                let _ = tx.send(ApplyMsg::Snapshot {
                    data: freshest.snapshot.clone(),
                    index: freshest.snapshot_index,
                });
            }
            slot.persister = freshest;
        }

        let from = self.replicas[id].delivered + 1;
        let messages: Vec<ApplyMsg> = (from..=self.commit)
            .map(|index| ApplyMsg::Command {
                command: self.entry(index).command.clone(),
                index,
            })
            .collect();
        let slot = &mut self.replicas[id];
        slot.delivered = slot.delivered.max(self.commit);
        if let Some(tx) = &slot.apply_tx {
            for msg in messages {
                let _ = tx.send(msg);
            }
        }
    }

    /// Drops the log prefix every reachable replica has covered by a snapshot.
    fn compact(&mut self) {
        let Some(floor) = self
            .replicas
            .iter()
            .filter(|r| r.reachable())
            .map(|r| r.persister.snapshot_index)
            .min()
        else {
            return;
        };
        let new_base = floor.min(self.commit);
        if new_base <= self.base {
            return;
        }
        self.entries.drain(..(new_base - self.base) as usize);
        self.base = new_base;
        debug!(base = self.base, "log prefix discarded");
    }

    fn retained_size(&self, id: ReplicaId) -> usize {
        let from = self.base.max(self.replicas[id].persister.snapshot_index);
        let skip = (from - self.base) as usize;
        self.entries.iter().skip(skip).map(|e| e.size).sum()
    }
}

/// Shared handle to a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimCluster {
    inner: Arc<Mutex<ClusterState>>,
}

impl SimCluster {
    /// Creates a cluster of `n` replicas. None of them runs until
    /// [`SimCluster::replica`] starts it.
    pub fn new(n: usize) -> Self {
        let replicas = (0..n)
            .map(|_| ReplicaSlot {
                connected: true,
                ..ReplicaSlot::default()
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(ClusterState {
                term: 0,
                leader: None,
                base: 0,
                entries: Vec::new(),
                commit: 0,
                commit_term: 0,
                replicas,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts (or restarts) replica `id` from its persisted state.
    ///
    /// The returned stream first replays the replica's own snapshot, then
    /// every committed entry after it.
    pub fn replica(&self, id: ReplicaId) -> (SimRaft, UnboundedReceiver<ApplyMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let slot = &mut state.replicas[id];
        slot.incarnation += 1;
        slot.alive = true;
        slot.believes_leader = false;
        slot.known_leader = None;
        slot.delivered = slot.persister.snapshot_index;
        if slot.persister.snapshot_index > 0 {
            let _ = tx.send(ApplyMsg::Snapshot {
                data: slot.persister.snapshot.clone(),
                index: slot.persister.snapshot_index,
            });
        }
        slot.apply_tx = Some(tx);
        let incarnation = slot.incarnation;
        info!(replica = id, incarnation, "replica started");

        state.sync_slot(id);
        state.try_commit();
        state.deliver(id);
        drop(state);

        (
            SimRaft {
                id,
                incarnation,
                cluster: self.clone(),
            },
            rx,
        )
    }

    /// Makes `id` the leader of a new term. Fails if `id` is down or cut
    /// off, or if no majority is reachable.
    pub fn elect(&self, id: ReplicaId) -> bool {
        let mut state = self.lock();
        if !state.replicas[id].reachable() || !state.has_majority() {
            return false;
        }
        state.term += 1;
        state.leader = Some(id);
        let keep = (state.commit - state.base) as usize;
        let dropped = state.entries.len() - keep;
        state.entries.truncate(keep);
        info!(replica = id, term = state.term, dropped, "leader elected");
        for other in 0..state.replicas.len() {
            state.sync_slot(other);
        }
        true
    }

    /// Stops replica `id`. Its persisted snapshot survives.
    pub fn crash(&self, id: ReplicaId) {
        let mut state = self.lock();
        let slot = &mut state.replicas[id];
        if !slot.alive {
            return;
        }
        slot.alive = false;
        slot.incarnation += 1;
        slot.believes_leader = false;
        slot.apply_tx = None;
        if state.leader == Some(id) {
            state.leader = None;
        }
        info!(replica = id, "replica crashed");
    }

    /// Cuts `id` off from every other replica.
    pub fn disconnect(&self, id: ReplicaId) {
        self.lock().replicas[id].connected = false;
        info!(replica = id, "replica disconnected");
    }

    /// Reattaches `id`; it learns the current term and catches up.
    pub fn connect(&self, id: ReplicaId) {
        let mut state = self.lock();
        state.replicas[id].connected = true;
        info!(replica = id, "replica connected");
        state.sync_slot(id);
        state.try_commit();
        state.deliver(id);
    }

    pub fn leader(&self) -> Option<ReplicaId> {
        self.lock().leader
    }

    pub fn term(&self) -> Term {
        self.lock().term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.lock().commit
    }

    /// Bytes of log `id` still has to retain.
    pub fn log_size(&self, id: ReplicaId) -> usize {
        self.lock().retained_size(id)
    }

    pub fn snapshot_index(&self, id: ReplicaId) -> LogIndex {
        self.lock().replicas[id].persister.snapshot_index
    }

    /// Index of the oldest entry still held in the shared log, minus one.
    pub fn log_base(&self) -> LogIndex {
        self.lock().base
    }
}

/// One replica's view of a [`SimCluster`].
#[derive(Debug, Clone)]
pub struct SimRaft {
    id: ReplicaId,
    incarnation: u64,
    cluster: SimCluster,
}

impl SimRaft {
    /// Runs `f` against this replica's slot if this handle is still current.
    fn with_slot<T>(&self, dead: T, f: impl FnOnce(&ClusterState, &ReplicaSlot) -> T) -> T {
        let state = self.cluster.lock();
        let slot = &state.replicas[self.id];
        if !slot.alive || slot.incarnation != self.incarnation {
            return dead;
        }
        f(&state, slot)
    }

    fn deposed(&self) -> bool {
        self.with_slot(true, |state, slot| {
            !(slot.connected && state.leader == Some(self.id) && state.has_majority())
        })
    }
}

impl Consensus for SimRaft {
    fn start(&self, command: Command) -> Proposal {
        let mut state = self.cluster.lock();
        let slot = &state.replicas[self.id];
        let current = slot.alive && slot.incarnation == self.incarnation;
        if !current || !slot.believes_leader {
            return Proposal {
                index: 0,
                term: slot.term,
                is_leader: false,
            };
        }
        if !slot.connected || state.leader != Some(self.id) {
            // A partitioned ex-leader accepts the proposal but it can never commit.
            return Proposal {
                index: state.last_index() + 1,
                term: slot.term,
                is_leader: true,
            };
        }

        let term = state.term;
        let size = command.encoded_len() + ENTRY_HEADER_LEN;
        state.entries.push(Entry {
            term,
            command,
            size,
        });
        let index = state.last_index();
        debug!(replica = self.id, index, term, "proposal appended");
        state.try_commit();
        Proposal {
            index,
            term,
            is_leader: true,
        }
    }

    fn state(&self) -> (Term, bool) {
        self.with_slot((0, false), |_, slot| (slot.term, slot.believes_leader))
    }

    fn commit_index(&self) -> LogIndex {
        self.with_slot(0, |_, slot| slot.commit)
    }

    fn leader_id(&self) -> Option<ReplicaId> {
        self.with_slot(None, |_, slot| slot.known_leader)
    }

    fn check_if_deposed(&self) -> impl Future<Output = bool> + Send {
        std::future::ready(self.deposed())
    }

    fn is_restored(&self) -> bool {
        self.with_slot(false, |_, slot| {
            slot.believes_leader && slot.commit_term == slot.term
        })
    }

    fn snapshot(&self, index: LogIndex, data: Vec<u8>) {
        let mut state = self.cluster.lock();
        let slot = &mut state.replicas[self.id];
        if !slot.alive || slot.incarnation != self.incarnation {
            return;
        }
        if index <= slot.persister.snapshot_index || index > slot.delivered {
            return;
        }
        slot.persister = Persister {
            snapshot: data,
            snapshot_index: index,
        };
        debug!(replica = self.id, index, "snapshot persisted");
        state.compact();
    }

    fn needs_compaction(&self, threshold: usize) -> bool {
        let state = self.cluster.lock();
        state.replicas[self.id].alive && state.retained_size(self.id) > threshold
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.cluster.lock().replicas[self.id].persister.snapshot.clone()
    }

    fn kill(&self) {
        let current = {
            let state = self.cluster.lock();
            let slot = &state.replicas[self.id];
            slot.alive && slot.incarnation == self.incarnation
        };
        if current {
            self.cluster.crash(self.id);
        }
    }
}
