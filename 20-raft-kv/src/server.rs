//! The replica: RPC handlers, the apply loop, and snapshotting.
//!
//! All replica-local state sits behind one mutex that is only held for short
//! critical sections and never across an `.await`. The apply loop is the only
//! writer. Handlers learn about progress through a `watch` channel carrying
//! the apply cursor instead of polling it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::command::{ClientId, Command, LogIndex, Offset, ReplicaId};
use crate::consensus::{ApplyMsg, Consensus};
use crate::error::{KvError, KvResult};
use crate::rpc::{ErrCode, GetArgs, GetReply, PutAppendArgs, PutAppendReply};
use crate::store::{Freshness, StateMachine};

/// How long a write handler waits for its entry to be applied.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Snapshot once the retained log grows past this many bytes.
    /// `None` disables snapshotting.
    pub max_raft_state: Option<usize>,
    pub apply_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_raft_state: None,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Sets the snapshot threshold; any negative value disables it.
    pub fn with_max_raft_state(mut self, limit: i64) -> Self {
        self.max_raft_state = usize::try_from(limit).ok();
        self
    }
}

#[derive(Debug, Default)]
struct ReplicaState {
    machine: StateMachine,
    /// Highest log index reflected in `machine`.
    last_applied: LogIndex,
}

/// One replica of the key-value service.
pub struct KvServer<C> {
    me: ReplicaId,
    raft: C,
    config: ServerConfig,
    state: Mutex<ReplicaState>,
    applied: watch::Sender<LogIndex>,
    dead: watch::Sender<bool>,
}

impl<C: Consensus> KvServer<C> {
    /// Restores the latest snapshot and spawns the apply loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        me: ReplicaId,
        raft: C,
        apply_rx: UnboundedReceiver<ApplyMsg>,
        config: ServerConfig,
    ) -> KvResult<Arc<Self>> {
        let mut state = ReplicaState::default();
        if let Some(machine) = StateMachine::decode(&raft.read_snapshot())? {
            debug!(replica = me, keys = machine.data.len(), "restored persisted snapshot");
            state.machine = machine;
        }

        let (applied, _) = watch::channel(0);
        let (dead, _) = watch::channel(false);
        let server = Arc::new(Self {
            me,
            raft,
            config,
            state: Mutex::new(state),
            applied,
            dead,
        });

        tokio::spawn(Arc::clone(&server).run_apply_loop(apply_rx));
        info!(replica = me, "replica started");
        Ok(server)
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    pub fn raft(&self) -> &C {
        &self.raft
    }

    fn lock_state(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the apply loop and every pending wait.
    pub fn kill(&self) {
        if self.dead.send_replace(true) {
            return;
        }
        self.raft.kill();
        info!(replica = self.me, "replica killed");
    }

    pub fn killed(&self) -> bool {
        *self.dead.borrow()
    }

    /// Apply cursor: highest log index reflected in local state.
    pub fn last_applied(&self) -> LogIndex {
        self.lock_state().last_applied
    }

    /// Local, uncertified read of the applied state.
    pub fn local_value(&self, key: &str) -> Option<String> {
        self.lock_state().machine.data.get(key).map(str::to_string)
    }

    /// Number of keys in the applied state.
    pub fn len(&self) -> usize {
        self.lock_state().machine.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks shared by both handlers. Returns the code to answer with when
    /// the request cannot proceed.
    fn certify_leadership(&self) -> Option<ErrCode> {
        if self.killed() || !self.raft.is_leader() {
            return Some(ErrCode::WrongLeader);
        }
        if !self.raft.is_restored() {
            // Committing an entry of our own term is what lets reads be certified.
            self.raft.start(Command::NoOp);
            return Some(ErrCode::WaitForRecover);
        }
        None
    }

    pub async fn get(&self, args: GetArgs) -> GetReply {
        let mut reply = GetReply::wrong_leader(self.me, self.raft.leader_id());
        if let Some(err) = self.certify_leadership() {
            if err == ErrCode::WaitForRecover {
                debug!(replica = self.me, key = %args.key, "get rejected while recovering");
            }
            reply.err = err;
            return reply;
        }

        let read_index = self.raft.commit_index();
        let term = self.raft.term();
        if self.raft.check_if_deposed().await {
            debug!(replica = self.me, term, "deposed during read");
            return reply;
        }

        let state = self.lock_state();
        let fresh = state.last_applied >= read_index
            && self.raft.is_leader()
            && term == self.raft.term();
        if !fresh {
            // Raced a leadership or commit change; the client retries.
            reply.err = ErrCode::WaitForRecover;
            return reply;
        }
        match state.machine.data.get(&args.key) {
            Some(value) => {
                reply.err = ErrCode::Ok;
                reply.value = value.to_string();
            }
            None => reply.err = ErrCode::NoKey,
        }
        debug!(
            replica = self.me,
            key = %args.key,
            err = %reply.err,
            read_index,
            "get answered"
        );
        reply
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let mut reply = PutAppendReply::wrong_leader(self.me, self.raft.leader_id());
        if let Some(err) = self.certify_leadership() {
            reply.err = err;
            return reply;
        }

        match self.freshness(args.client_id, args.offset) {
            Freshness::Stale => return reply,
            Freshness::Applied => {
                reply.err = ErrCode::Ok;
                return reply;
            }
            Freshness::Fresh => {}
        }

        let PutAppendArgs {
            client_id,
            offset,
            key,
            value,
            kind,
        } = args;
        let proposal = self.raft.start(Command::Write {
            client_id,
            offset,
            kind,
            key,
            value,
        });
        if !proposal.is_leader {
            return reply;
        }
        debug!(
            replica = self.me,
            client = %client_id,
            offset,
            index = proposal.index,
            term = proposal.term,
            "write proposed"
        );

        if !self.wait_applied(proposal.index).await {
            debug!(
                replica = self.me,
                client = %client_id,
                offset,
                index = proposal.index,
                "write not applied in time"
            );
            return reply;
        }

        match self.freshness(client_id, offset) {
            Freshness::Applied => reply.err = ErrCode::Ok,
            Freshness::Stale => {}
            Freshness::Fresh if proposal.term != self.raft.term() => {
                debug!(
                    replica = self.me,
                    client = %client_id,
                    offset,
                    "proposal superseded by a newer term"
                );
            }
            Freshness::Fresh => {
                warn!(
                    replica = self.me,
                    client = %client_id,
                    offset,
                    index = proposal.index,
                    "index applied without this write"
                );
            }
        }
        reply
    }

    fn freshness(&self, client: ClientId, offset: Offset) -> Freshness {
        self.lock_state().machine.duplicates.classify(client, offset)
    }

    /// Waits until the apply cursor reaches `index`. Returns false on timeout
    /// or shutdown.
    async fn wait_applied(&self, index: LogIndex) -> bool {
        let mut applied = self.applied.subscribe();
        let reached = async move {
            loop {
                let current = *applied.borrow_and_update();
                if current >= index {
                    return true;
                }
                if applied.changed().await.is_err() {
                    return false;
                }
            }
        };

        tokio::select! {
            reached = tokio::time::timeout(self.config.apply_timeout, reached) => {
                reached.unwrap_or(false)
            }
            _ = wait_for_kill(self.dead.subscribe()) => false,
        }
    }

    async fn run_apply_loop(self: Arc<Self>, mut apply_rx: UnboundedReceiver<ApplyMsg>) {
        let killed = wait_for_kill(self.dead.subscribe());
        tokio::pin!(killed);

        loop {
            let msg = tokio::select! {
                msg = apply_rx.recv() => msg,
                _ = &mut killed => None,
            };
            let Some(msg) = msg else {
                break;
            };
            if let Err(err) = self.apply(msg) {
                error!(replica = self.me, error = %err, "apply loop stopped");
                self.kill();
                break;
            }
        }
        debug!(replica = self.me, "apply loop exited");
    }

    /// Applies one event from the committed-entry stream.
    fn apply(&self, msg: ApplyMsg) -> KvResult<()> {
        let mut state = self.lock_state();
        match msg {
            ApplyMsg::Command { command, index } => {
                if index <= state.last_applied {
                    warn!(
                        replica = self.me,
                        index,
                        last_applied = state.last_applied,
                        "skipping already applied entry"
                    );
                    return Ok(());
                }
                if index != state.last_applied + 1 {
                    return Err(KvError::ApplyGap {
                        last_applied: state.last_applied,
                        index,
                    });
                }
                if state.machine.apply(command) {
                    debug!(replica = self.me, index, "write applied");
                }
                state.last_applied = index;
                self.maybe_snapshot(&state, index)?;
            }
            ApplyMsg::Snapshot { data, index } => {
                if index <= state.last_applied {
                    debug!(
                        replica = self.me,
                        index,
                        last_applied = state.last_applied,
                        "ignoring stale snapshot"
                    );
                    return Ok(());
                }
                state.machine = StateMachine::decode(&data)?.unwrap_or_default();
                info!(
                    replica = self.me,
                    from = state.last_applied,
                    to = index,
                    "installed snapshot"
                );
                state.last_applied = index;
            }
        }
        self.applied.send_replace(state.last_applied);
        Ok(())
    }

    /// Hands a snapshot to the consensus module once its log is too large.
    fn maybe_snapshot(&self, state: &ReplicaState, index: LogIndex) -> KvResult<()> {
        let Some(limit) = self.config.max_raft_state else {
            return Ok(());
        };
        if !self.raft.needs_compaction(limit) {
            return Ok(());
        }
        let payload = state.machine.encode()?;
        debug!(
            replica = self.me,
            index,
            bytes = payload.len(),
            limit,
            "taking snapshot"
        );
        self.raft.snapshot(index, payload);
        Ok(())
    }
}

/// Resolves once the kill flag is set (or its sender is gone).
async fn wait_for_kill(mut dead: watch::Receiver<bool>) {
    loop {
        let killed = *dead.borrow_and_update();
        if killed || dead.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    use super::*;
    use crate::command::{Term, WriteKind};
    use crate::consensus::Proposal;
    use crate::sim::{SimCluster, SimRaft};

    /// Consensus stand-in whose term, leadership and commit index are set by the test.
    #[derive(Debug, Default)]
    struct Scripted {
        term: AtomicU64,
        leader: AtomicBool,
        commit: AtomicU64,
        proposals: AtomicU64,
        /// When nonzero, `check_if_deposed` moves to this term before answering.
        term_after_check: AtomicU64,
        /// When set, `check_if_deposed` drops leadership before answering.
        lose_leadership_on_check: AtomicBool,
    }

    impl Scripted {
        fn leading(term: Term) -> Self {
            let raft = Self::default();
            raft.term.store(term, Ordering::SeqCst);
            raft.leader.store(true, Ordering::SeqCst);
            raft
        }
    }

    impl Consensus for Scripted {
        fn start(&self, _command: Command) -> Proposal {
            let (term, is_leader) = self.state();
            let index = self.proposals.fetch_add(1, Ordering::SeqCst) + 1;
            Proposal {
                index,
                term,
                is_leader,
            }
        }

        fn state(&self) -> (Term, bool) {
            (
                self.term.load(Ordering::SeqCst),
                self.leader.load(Ordering::SeqCst),
            )
        }

        fn commit_index(&self) -> LogIndex {
            self.commit.load(Ordering::SeqCst)
        }

        fn leader_id(&self) -> Option<ReplicaId> {
            self.leader.load(Ordering::SeqCst).then_some(0)
        }

        fn check_if_deposed(&self) -> impl Future<Output = bool> + Send {
            let next = self.term_after_check.load(Ordering::SeqCst);
            if next != 0 {
                self.term.store(next, Ordering::SeqCst);
            }
            if self.lose_leadership_on_check.load(Ordering::SeqCst) {
                self.leader.store(false, Ordering::SeqCst);
            }
            std::future::ready(false)
        }

        fn is_restored(&self) -> bool {
            true
        }

        fn snapshot(&self, _index: LogIndex, _data: Vec<u8>) {}

        fn needs_compaction(&self, _threshold: usize) -> bool {
            false
        }

        fn read_snapshot(&self) -> Vec<u8> {
            Vec::new()
        }

        fn kill(&self) {}
    }

    fn scripted(
        raft: Scripted,
        config: ServerConfig,
    ) -> (Arc<KvServer<Scripted>>, UnboundedSender<ApplyMsg>) {
        let (tx, rx) = unbounded_channel();
        let server = KvServer::start(0, raft, rx, config).expect("start");
        (server, tx)
    }

    fn commit(tx: &UnboundedSender<ApplyMsg>, index: LogIndex, command: Command) {
        tx.send(ApplyMsg::Command { command, index }).expect("send");
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn single_replica(config: ServerConfig) -> (SimCluster, Arc<KvServer<SimRaft>>) {
        let cluster = SimCluster::new(1);
        let (raft, rx) = cluster.replica(0);
        let server = KvServer::start(0, raft, rx, config).expect("start");
        assert!(cluster.elect(0));
        (cluster, server)
    }

    fn put(client: ClientId, offset: Offset, key: &str, value: &str) -> PutAppendArgs {
        PutAppendArgs {
            client_id: client,
            offset,
            key: key.into(),
            value: value.into(),
            kind: WriteKind::Put,
        }
    }

    fn get(client: ClientId, offset: Offset, key: &str) -> GetArgs {
        GetArgs {
            client_id: client,
            offset,
            key: key.into(),
        }
    }

    #[tokio::test]
    async fn first_request_after_election_waits_for_recovery() {
        let (_cluster, server) = single_replica(ServerConfig::default());
        let reply = server.get(get(ClientId(1), 1, "x")).await;
        assert_eq!(reply.err, ErrCode::WaitForRecover);
        assert_eq!(reply.server_id, 0);
        assert_eq!(reply.leader_id, Some(0));

        // The no-op submitted above lets the retry through.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reply = server.get(get(ClientId(1), 1, "x")).await;
        assert_eq!(reply.err, ErrCode::NoKey);
        assert!(reply.value.is_empty());
    }

    #[tokio::test]
    async fn duplicate_write_is_acknowledged_from_cache() {
        let (_cluster, server) = single_replica(ServerConfig::default());
        server.raft().start(Command::NoOp);
        let client = ClientId(7);

        let reply = server.put_append(put(client, 1, "x", "1")).await;
        assert_eq!(reply.err, ErrCode::Ok);
        let applied = server.last_applied();

        let retry = server.put_append(put(client, 1, "x", "1")).await;
        assert_eq!(retry.err, ErrCode::Ok);
        assert_eq!(server.last_applied(), applied, "retry must not reach the log");

        let stale = server.put_append(put(client, 0, "x", "old")).await;
        assert_eq!(stale.err, ErrCode::WrongLeader);
        assert_eq!(server.local_value("x").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn killed_replica_refuses_requests() {
        let (_cluster, server) = single_replica(ServerConfig::default());
        server.kill();
        assert!(server.killed());
        let reply = server.put_append(put(ClientId(1), 1, "x", "1")).await;
        assert_eq!(reply.err, ErrCode::WrongLeader);
    }

    #[tokio::test]
    async fn corrupt_snapshot_stops_the_replica() {
        let cluster = SimCluster::new(1);
        let (raft, _rx) = cluster.replica(0);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let server = KvServer::start(0, raft, rx, ServerConfig::default()).expect("start");

        tx.send(ApplyMsg::Snapshot {
            data: vec![0xff, 0x01],
            index: 5,
        })
        .expect("send");
        tokio::time::timeout(Duration::from_secs(1), async {
            while !server.killed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("replica should stop");
        assert_eq!(server.last_applied(), 0);
    }

    #[tokio::test]
    async fn stale_snapshot_is_ignored() {
        let cluster = SimCluster::new(1);
        let (raft, _rx) = cluster.replica(0);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let server = KvServer::start(0, raft, rx, ServerConfig::default()).expect("start");

        let mut newer = StateMachine::new();
        newer.apply(Command::put(ClientId(1), 1, "x", "new"));
        let mut older = StateMachine::new();
        older.apply(Command::put(ClientId(1), 1, "x", "old"));

        tx.send(ApplyMsg::Snapshot {
            data: newer.encode().expect("encode"),
            index: 10,
        })
        .expect("send");
        tx.send(ApplyMsg::Snapshot {
            data: older.encode().expect("encode"),
            index: 4,
        })
        .expect("send");
        tx.send(ApplyMsg::Command {
            command: Command::NoOp,
            index: 11,
        })
        .expect("send");

        tokio::time::timeout(Duration::from_secs(1), async {
            while server.last_applied() < 11 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("apply loop should catch up");
        assert_eq!(server.local_value("x").as_deref(), Some("new"));
    }

    #[test]
    fn negative_threshold_disables_snapshots() {
        assert_eq!(ServerConfig::default().with_max_raft_state(-1).max_raft_state, None);
        assert_eq!(
            ServerConfig::default().with_max_raft_state(1000).max_raft_state,
            Some(1000)
        );
    }

    #[tokio::test]
    async fn read_waits_for_the_apply_cursor_to_reach_the_commit_index() {
        let raft = Scripted::leading(1);
        raft.commit.store(3, Ordering::SeqCst);
        let (server, tx) = scripted(raft, ServerConfig::default());

        for key in ["x", "missing"] {
            let reply = server.get(get(ClientId(1), 1, key)).await;
            assert_eq!(reply.err, ErrCode::WaitForRecover, "{key}");
            assert!(reply.value.is_empty());
        }

        commit(&tx, 1, Command::put(ClientId(2), 1, "x", "1"));
        commit(&tx, 2, Command::NoOp);
        commit(&tx, 3, Command::NoOp);
        eventually(|| server.last_applied() == 3).await;

        let reply = server.get(get(ClientId(1), 1, "x")).await;
        assert_eq!(reply.err, ErrCode::Ok);
        assert_eq!(reply.value, "1");
    }

    #[tokio::test]
    async fn read_refused_when_term_moves_during_certification() {
        let raft = Scripted::leading(1);
        raft.commit.store(1, Ordering::SeqCst);
        raft.term_after_check.store(2, Ordering::SeqCst);
        let (server, tx) = scripted(raft, ServerConfig::default());
        commit(&tx, 1, Command::put(ClientId(2), 1, "x", "1"));
        eventually(|| server.last_applied() == 1).await;

        let reply = server.get(get(ClientId(1), 1, "x")).await;
        assert_eq!(reply.err, ErrCode::WaitForRecover);
        assert!(reply.value.is_empty());

        // The term has settled at 2, so the retry is certified.
        let reply = server.get(get(ClientId(1), 1, "x")).await;
        assert_eq!(reply.err, ErrCode::Ok);
        assert_eq!(reply.value, "1");
    }

    #[tokio::test]
    async fn read_refused_when_leadership_is_lost_during_certification() {
        let raft = Scripted::leading(1);
        raft.lose_leadership_on_check.store(true, Ordering::SeqCst);
        let (server, _tx) = scripted(raft, ServerConfig::default());

        let reply = server.get(get(ClientId(1), 1, "x")).await;
        assert_eq!(reply.err, ErrCode::WaitForRecover);
        assert!(!server.raft().is_leader());
    }

    #[tokio::test]
    async fn write_superseded_by_a_newer_term_is_not_acknowledged() {
        let config = ServerConfig {
            apply_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        };
        let (server, tx) = scripted(Scripted::leading(1), config);

        let pending = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.put_append(put(ClientId(7), 1, "x", "mine")).await }
        });
        eventually(|| server.raft().proposals.load(Ordering::SeqCst) == 1).await;

        // A newer leader filled index 1 with another client's write.
        server.raft().term.store(2, Ordering::SeqCst);
        commit(&tx, 1, Command::put(ClientId(8), 1, "x", "theirs"));

        let reply = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("answered once the index is applied")
            .expect("task");
        assert_eq!(reply.err, ErrCode::WrongLeader);
        assert_eq!(server.local_value("x").as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn gap_in_committed_entries_stops_the_replica() {
        let (server, tx) = scripted(Scripted::leading(1), ServerConfig::default());
        commit(&tx, 1, Command::NoOp);
        commit(&tx, 3, Command::NoOp);

        eventually(|| server.killed()).await;
        assert_eq!(server.last_applied(), 1);
    }
}
