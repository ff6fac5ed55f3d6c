//! The clerk: a client-side router that turns `get`/`put`/`append` into
//! retried RPCs until some replica certifies an answer.
//!
//! A clerk issues one operation at a time. Each operation carries the
//! clerk's current offset, which only moves forward once a reply is
//! acknowledged. That pairing is what lets replicas filter retried writes.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::command::{ClientId, Offset, ReplicaId, WriteKind};
use crate::error::{KvError, KvResult};
use crate::rpc::{ErrCode, GetArgs, PutAppendArgs};
use crate::transport::{CallError, Transport};

#[derive(Debug, Clone)]
pub struct ClerkConfig {
    /// Pause before resending to a replica that answered `WaitForRecover`.
    pub wait_for_recover_backoff: Duration,
    /// Retries of one replica, after the first send, before the clerk moves on anyway.
    pub max_same_target_retries: u32,
}

impl Default for ClerkConfig {
    fn default() -> Self {
        Self {
            wait_for_recover_backoff: Duration::from_millis(200),
            max_same_target_retries: 5,
        }
    }
}

/// Translation between replica ids and the clerk's own numbering.
///
/// Replicas name themselves (and the leader they know of) by replica id,
/// while the clerk addresses them by position in its transport. Entries are
/// learned from the `server_id` field of every reply.
#[derive(Debug, Clone, Default)]
pub struct RoutingCache {
    server_to_local: HashMap<ReplicaId, usize>,
    local_to_server: HashMap<usize, ReplicaId>,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that local index `local` answered as replica `server`.
    pub fn learn(&mut self, local: usize, server: ReplicaId) {
        if self.local_to_server.get(&local) == Some(&server) {
            return;
        }
        if let Some(old_server) = self.local_to_server.insert(local, server) {
            self.server_to_local.remove(&old_server);
        }
        if let Some(old_local) = self.server_to_local.insert(server, local) {
            if old_local != local {
                self.local_to_server.remove(&old_local);
            }
        }
    }

    pub fn local_for(&self, server: ReplicaId) -> Option<usize> {
        self.server_to_local.get(&server).copied()
    }

    pub fn server_for(&self, local: usize) -> Option<ReplicaId> {
        self.local_to_server.get(&local).copied()
    }
}

/// Which replica to try next and how often it has been tried in a row.
#[derive(Debug)]
struct Router {
    servers: usize,
    target: usize,
    last_sent: Option<usize>,
    same_target_sends: u32,
    max_same_target_retries: u32,
    routes: RoutingCache,
}

impl Router {
    fn new(servers: usize, max_same_target_retries: u32) -> Self {
        let target = if servers == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..servers)
        };
        Self {
            servers,
            target,
            last_sent: None,
            same_target_sends: 0,
            max_same_target_retries,
            routes: RoutingCache::new(),
        }
    }

    /// Picks the replica for the next send, forcing a move when one replica
    /// has been retried too often without making progress.
    fn next_send(&mut self) -> usize {
        let repeat = self.last_sent == Some(self.target);
        if repeat && self.same_target_sends > self.max_same_target_retries {
            debug!(
                local = self.target,
                sends = self.same_target_sends,
                "moving off a stalled replica"
            );
            self.advance();
        }
        if self.last_sent == Some(self.target) {
            self.same_target_sends += 1;
        } else {
            self.same_target_sends = 1;
        }
        self.last_sent = Some(self.target);
        self.target
    }

    /// A replica answered definitively; the stall count starts over.
    fn settle(&mut self) {
        self.last_sent = None;
    }

    fn advance(&mut self) {
        self.target = (self.target + 1) % self.servers;
    }

    /// Follows a leader hint when it can be translated, otherwise round-robins.
    fn redirect(&mut self, hint: Option<ReplicaId>) {
        match hint.and_then(|leader| self.routes.local_for(leader)) {
            Some(local) if local != self.target => self.target = local,
            _ => self.advance(),
        }
    }
}

/// Client handle to the replicated key-value service.
#[derive(Debug)]
pub struct Clerk<T> {
    transport: T,
    config: ClerkConfig,
    client_id: ClientId,
    offset: Offset,
    router: Router,
}

impl<T: Transport> Clerk<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClerkConfig::default())
    }

    pub fn with_config(transport: T, config: ClerkConfig) -> Self {
        let router = Router::new(transport.server_count(), config.max_same_target_retries);
        Self {
            transport,
            config,
            client_id: ClientId::random(),
            offset: 1,
            router,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Offset the next operation will carry.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn routes(&self) -> &RoutingCache {
        &self.router.routes
    }

    /// Fetches the current value of `key`; a missing key reads as `""`.
    ///
    /// Keeps trying until some replica answers. The only errors are protocol
    /// violations and a clerk with no replicas.
    pub async fn get(&mut self, key: &str) -> KvResult<String> {
        self.ensure_servers()?;
        let args = GetArgs {
            client_id: self.client_id,
            offset: self.offset,
            key: key.to_string(),
        };

        loop {
            let target = self.router.next_send();
            let reply = match self.transport.get(target, args.clone()).await {
                Ok(reply) => reply,
                Err(CallError::Lost) => {
                    debug!(local = target, key, "get lost");
                    self.router.advance();
                    continue;
                }
                Err(CallError::Rejected(message)) => return Err(KvError::protocol(message)),
            };
            self.router.routes.learn(target, reply.server_id);

            match reply.err {
                ErrCode::Ok => {
                    self.router.settle();
                    self.offset += 1;
                    return Ok(reply.value);
                }
                ErrCode::NoKey => {
                    self.router.settle();
                    return Ok(String::new());
                }
                ErrCode::WrongLeader => self.router.redirect(reply.leader_id),
                ErrCode::WaitForRecover => {
                    tokio::time::sleep(self.config.wait_for_recover_backoff).await;
                }
                ErrCode::Unknown(code) => {
                    return Err(KvError::protocol(format!(
                        "replica {} answered get with unknown code {code:?}",
                        reply.server_id
                    )));
                }
            }
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) -> KvResult<()> {
        self.put_append(key, value, WriteKind::Put).await
    }

    pub async fn append(&mut self, key: &str, value: &str) -> KvResult<()> {
        self.put_append(key, value, WriteKind::Append).await
    }

    /// Applies a write exactly once, however many times it has to be resent.
    pub async fn put_append(&mut self, key: &str, value: &str, kind: WriteKind) -> KvResult<()> {
        self.ensure_servers()?;
        let args = PutAppendArgs {
            client_id: self.client_id,
            offset: self.offset,
            key: key.to_string(),
            value: value.to_string(),
            kind,
        };

        loop {
            let target = self.router.next_send();
            let reply = match self.transport.put_append(target, args.clone()).await {
                Ok(reply) => reply,
                Err(CallError::Lost) => {
                    debug!(local = target, key, %kind, "write lost");
                    self.router.advance();
                    continue;
                }
                Err(CallError::Rejected(message)) => return Err(KvError::protocol(message)),
            };
            self.router.routes.learn(target, reply.server_id);

            match reply.err {
                ErrCode::Ok => {
                    self.router.settle();
                    self.offset += 1;
                    return Ok(());
                }
                ErrCode::WrongLeader => self.router.redirect(reply.leader_id),
                ErrCode::WaitForRecover => {
                    tokio::time::sleep(self.config.wait_for_recover_backoff).await;
                }
                ErrCode::NoKey | ErrCode::Unknown(_) => {
                    return Err(KvError::protocol(format!(
                        "replica {} answered {kind} with {}",
                        reply.server_id, reply.err
                    )));
                }
            }
        }
    }

    fn ensure_servers(&self) -> KvResult<()> {
        if self.router.servers == 0 {
            return Err(KvError::NoReplicas);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::rpc::{GetReply, PutAppendReply};

    /// Answers from a script and records which local index each call hit.
    #[derive(Clone, Default)]
    struct Scripted {
        servers: usize,
        replies: Arc<Mutex<VecDeque<Result<(ErrCode, Option<ReplicaId>), CallError>>>>,
        sent: Arc<Mutex<Vec<usize>>>,
    }

    impl Scripted {
        fn new(servers: usize) -> Self {
            Self {
                servers,
                ..Self::default()
            }
        }

        fn push(&self, reply: Result<(ErrCode, Option<ReplicaId>), CallError>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn sent(&self) -> Vec<usize> {
            self.sent.lock().unwrap().clone()
        }

        /// Local index `i` is replica `servers - 1 - i`, so nothing lines up by accident.
        fn next(
            &self,
            target: usize,
        ) -> Result<(ErrCode, Option<ReplicaId>, ReplicaId), CallError> {
            self.sent.lock().unwrap().push(target);
            let (err, leader) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((ErrCode::Ok, None)))?;
            Ok((err, leader, self.servers - 1 - target))
        }
    }

    impl Transport for Scripted {
        fn server_count(&self) -> usize {
            self.servers
        }

        async fn get(&self, target: usize, _args: GetArgs) -> Result<GetReply, CallError> {
            let (err, leader_id, server_id) = self.next(target)?;
            Ok(GetReply {
                err,
                value: "v".into(),
                leader_id,
                server_id,
            })
        }

        async fn put_append(
            &self,
            target: usize,
            _args: PutAppendArgs,
        ) -> Result<PutAppendReply, CallError> {
            let (err, leader_id, server_id) = self.next(target)?;
            Ok(PutAppendReply {
                err,
                leader_id,
                server_id,
            })
        }
    }

    fn fast() -> ClerkConfig {
        ClerkConfig {
            wait_for_recover_backoff: Duration::from_millis(1),
            ..ClerkConfig::default()
        }
    }

    #[test]
    fn routing_cache_forgets_remapped_entries() {
        let mut routes = RoutingCache::new();
        routes.learn(0, 2);
        routes.learn(1, 0);
        assert_eq!(routes.local_for(2), Some(0));
        assert_eq!(routes.server_for(1), Some(0));

        routes.learn(0, 1);
        assert_eq!(routes.local_for(2), None);
        assert_eq!(routes.local_for(1), Some(0));

        routes.learn(1, 1);
        assert_eq!(routes.server_for(0), None);
        assert_eq!(routes.local_for(1), Some(1));
    }

    #[tokio::test]
    async fn offset_advances_only_on_success() {
        let transport = Scripted::new(3);
        transport.push(Err(CallError::Lost));
        transport.push(Ok((ErrCode::WrongLeader, None)));
        let mut clerk = Clerk::with_config(transport.clone(), fast());

        clerk.put("x", "1").await.expect("put");
        assert_eq!(clerk.offset(), 2);
        assert_eq!(transport.sent().len(), 3);

        transport.push(Ok((ErrCode::NoKey, None)));
        assert_eq!(clerk.get("missing").await.expect("get"), "");
        assert_eq!(clerk.offset(), 2, "NoKey does not acknowledge the offset");
    }

    #[tokio::test]
    async fn follows_leader_hint_once_learned() {
        let transport = Scripted::new(3);
        let mut clerk = Clerk::with_config(transport.clone(), fast());
        // Learn the full mapping first.
        for _ in 0..3 {
            transport.push(Ok((ErrCode::WrongLeader, None)));
        }
        transport.push(Ok((ErrCode::Ok, None)));
        clerk.get("k").await.expect("get");

        // Point at a replica other than the one currently targeted.
        let current = *transport.sent().last().expect("sent");
        let leader_local = (current + 1) % 3;
        let leader = 2 - leader_local;
        let before = transport.sent().len();
        transport.push(Ok((ErrCode::WrongLeader, Some(leader))));
        clerk.get("k").await.expect("get");
        let sent = transport.sent();
        assert_eq!(sent.len(), before + 2);
        assert_eq!(sent[sent.len() - 1], leader_local);
    }

    #[tokio::test]
    async fn stalled_target_is_abandoned() {
        let transport = Scripted::new(2);
        for _ in 0..7 {
            transport.push(Ok((ErrCode::WaitForRecover, None)));
        }
        let mut clerk = Clerk::with_config(transport.clone(), fast());
        clerk.get("k").await.expect("get");

        // One send plus five retries, then the other replica.
        let sent = transport.sent();
        assert_eq!(sent.len(), 8);
        assert!(sent[..6].iter().all(|&t| t == sent[0]));
        assert!(sent[6..].iter().all(|&t| t != sent[0]));
    }

    #[tokio::test]
    async fn protocol_violations_surface() {
        let transport = Scripted::new(1);
        transport.push(Ok((ErrCode::NoKey, None)));
        let mut clerk = Clerk::with_config(transport.clone(), fast());
        let err = clerk.append("k", "v").await.expect_err("NoKey on a write");
        assert!(matches!(err, KvError::Protocol { .. }));

        transport.push(Ok((ErrCode::Unknown("ErrBogus".into()), None)));
        let err = clerk.get("k").await.expect_err("unknown code");
        assert!(matches!(err, KvError::Protocol { .. }), "{err}");

        transport.push(Err(CallError::Rejected("malformed".into())));
        assert!(clerk.get("k").await.is_err());
        assert_eq!(clerk.offset(), 1);
    }

    #[tokio::test]
    async fn empty_clerk_reports_no_replicas() {
        let mut clerk = Clerk::new(Scripted::new(0));
        assert!(matches!(clerk.get("k").await, Err(KvError::NoReplicas)));
    }
}
