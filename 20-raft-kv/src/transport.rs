//! How a [`crate::client::Clerk`] reaches replicas.
//!
//! A transport only delivers a call and brings back a reply. It never
//! retries. Losing a call is an ordinary outcome that the clerk handles by
//! moving on to another replica.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

use crate::command::ReplicaId;
use crate::consensus::Consensus;
use crate::rpc::{
    read_message, write_message, GetArgs, GetReply, PutAppendArgs, PutAppendReply, Request,
    Response,
};
use crate::server::KvServer;

/// Why a call produced no usable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No reply: the request or reply was lost, timed out, or the replica is down.
    Lost,
    /// The replica could not make sense of the request.
    Rejected(String),
}

pub trait Transport: Send + Sync {
    /// Number of replicas this transport can address, numbered `0..n` locally.
    fn server_count(&self) -> usize;

    fn get(
        &self,
        target: usize,
        args: GetArgs,
    ) -> impl Future<Output = Result<GetReply, CallError>> + Send;

    fn put_append(
        &self,
        target: usize,
        args: PutAppendArgs,
    ) -> impl Future<Output = Result<PutAppendReply, CallError>> + Send;
}

/// Probability of losing a request or a reply on an unreliable network.
const DROP_PROBABILITY: f64 = 0.1;
/// Upper bound on the extra latency of an unreliable network.
const MAX_JITTER: Duration = Duration::from_millis(5);

struct Endpoint<C> {
    server: Option<Arc<KvServer<C>>>,
    reachable: bool,
}

struct LocalNetwork<C> {
    endpoints: RwLock<Vec<Endpoint<C>>>,
    unreliable: AtomicBool,
    calls: AtomicU64,
}

/// In-process transport that calls replica handlers directly.
///
/// Every clone shares one network. [`LocalTransport::shuffled`] hands out a
/// view with its own local numbering of the replicas, the way separately
/// configured clients would list them.
pub struct LocalTransport<C> {
    net: Arc<LocalNetwork<C>>,
    order: Vec<ReplicaId>,
}

impl<C> Clone for LocalTransport<C> {
    fn clone(&self) -> Self {
        Self {
            net: Arc::clone(&self.net),
            order: self.order.clone(),
        }
    }
}

impl<C: Consensus> LocalTransport<C> {
    /// Creates a network with `n` empty, reachable endpoints.
    pub fn new(n: usize) -> Self {
        let endpoints = (0..n)
            .map(|_| Endpoint {
                server: None,
                reachable: true,
            })
            .collect();
        Self {
            net: Arc::new(LocalNetwork {
                endpoints: RwLock::new(endpoints),
                unreliable: AtomicBool::new(false),
                calls: AtomicU64::new(0),
            }),
            order: (0..n).collect(),
        }
    }

    /// Same network, random local numbering.
    pub fn shuffled(&self) -> Self {
        let mut order = self.order.clone();
        order.shuffle(&mut rand::thread_rng());
        Self {
            net: Arc::clone(&self.net),
            order,
        }
    }

    /// Same network, explicit local numbering: local index `i` addresses
    /// replica `order[i]`.
    pub fn with_order(&self, order: Vec<ReplicaId>) -> Self {
        Self {
            net: Arc::clone(&self.net),
            order,
        }
    }

    pub fn install(&self, replica: ReplicaId, server: Arc<KvServer<C>>) {
        self.endpoints_mut()[replica].server = Some(server);
    }

    pub fn remove(&self, replica: ReplicaId) -> Option<Arc<KvServer<C>>> {
        self.endpoints_mut()[replica].server.take()
    }

    pub fn server(&self, replica: ReplicaId) -> Option<Arc<KvServer<C>>> {
        self.net
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)[replica]
            .server
            .clone()
    }

    pub fn set_reachable(&self, replica: ReplicaId, reachable: bool) {
        self.endpoints_mut()[replica].reachable = reachable;
    }

    /// Drops requests and replies at random and adds a little latency.
    pub fn set_unreliable(&self, unreliable: bool) {
        self.net.unreliable.store(unreliable, Ordering::Relaxed);
    }

    /// Calls attempted through this network so far, lost or not.
    pub fn calls(&self) -> u64 {
        self.net.calls.load(Ordering::Relaxed)
    }

    fn endpoints_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Endpoint<C>>> {
        self.net
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a local index to a live, reachable replica.
    fn resolve(&self, target: usize) -> Option<Arc<KvServer<C>>> {
        self.net.calls.fetch_add(1, Ordering::Relaxed);
        let replica = *self.order.get(target)?;
        let endpoints = self
            .net
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let endpoint = endpoints.get(replica)?;
        if !endpoint.reachable {
            return None;
        }
        endpoint.server.clone()
    }

    /// Decides the fate of one call: (drop request, drop reply, delay).
    fn faults(&self) -> (bool, bool, Duration) {
        if !self.net.unreliable.load(Ordering::Relaxed) {
            return (false, false, Duration::ZERO);
        }
        let mut rng = rand::thread_rng();
        let delay = rng.gen_range(Duration::ZERO..MAX_JITTER);
        (
            rng.gen_bool(DROP_PROBABILITY),
            rng.gen_bool(DROP_PROBABILITY),
            delay,
        )
    }
}

impl<C: Consensus> Transport for LocalTransport<C> {
    fn server_count(&self) -> usize {
        self.order.len()
    }

    async fn get(&self, target: usize, args: GetArgs) -> Result<GetReply, CallError> {
        let server = self.resolve(target).ok_or(CallError::Lost)?;
        let (drop_request, drop_reply, delay) = self.faults();
        tokio::time::sleep(delay).await;
        if drop_request {
            return Err(CallError::Lost);
        }
        let reply = server.get(args).await;
        if drop_reply {
            return Err(CallError::Lost);
        }
        Ok(reply)
    }

    async fn put_append(
        &self,
        target: usize,
        args: PutAppendArgs,
    ) -> Result<PutAppendReply, CallError> {
        let server = self.resolve(target).ok_or(CallError::Lost)?;
        let (drop_request, drop_reply, delay) = self.faults();
        tokio::time::sleep(delay).await;
        if drop_request {
            return Err(CallError::Lost);
        }
        let reply = server.put_append(args).await;
        if drop_reply {
            return Err(CallError::Lost);
        }
        Ok(reply)
    }
}

/// Default bound on one TCP round trip.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport that opens one TCP connection per call and exchanges a single
/// JSON line each way.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    servers: Vec<SocketAddr>,
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn call(&self, target: usize, request: Request) -> Result<Response, CallError> {
        let addr = *self.servers.get(target).ok_or(CallError::Lost)?;
        match tokio::time::timeout(self.call_timeout, exchange(addr, &request)).await {
            Ok(Ok(Some(Response::Error { message }))) => Err(CallError::Rejected(message)),
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => {
                debug!(%addr, "connection closed before reply");
                Err(CallError::Lost)
            }
            Ok(Err(err)) => {
                debug!(%addr, error = %err, "call failed");
                Err(CallError::Lost)
            }
            Err(_) => {
                debug!(%addr, "call timed out");
                Err(CallError::Lost)
            }
        }
    }
}

async fn exchange(addr: SocketAddr, request: &Request) -> std::io::Result<Option<Response>> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    write_message(&mut writer, request).await?;
    let mut reader = BufReader::new(reader);
    read_message(&mut reader).await
}

fn unexpected(expected: &str, response: &Response) -> CallError {
    CallError::Rejected(format!("expected a {expected} reply, got {response:?}"))
}

impl Transport for TcpTransport {
    fn server_count(&self) -> usize {
        self.servers.len()
    }

    async fn get(&self, target: usize, args: GetArgs) -> Result<GetReply, CallError> {
        match self.call(target, Request::Get(args)).await? {
            Response::Get(reply) => Ok(reply),
            other => Err(unexpected("get", &other)),
        }
    }

    async fn put_append(
        &self,
        target: usize,
        args: PutAppendArgs,
    ) -> Result<PutAppendReply, CallError> {
        match self.call(target, Request::PutAppend(args)).await? {
            Response::PutAppend(reply) => Ok(reply),
            other => Err(unexpected("put_append", &other)),
        }
    }
}
