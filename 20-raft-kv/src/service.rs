//! Exposes one replica over TCP.
//!
//! Each connection carries JSON lines: a [`Request`] in, a [`Response`] out,
//! as many times as the peer likes. Connections are served on their own
//! task, so a slow write handler never holds up another caller.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    consensus::Consensus,
    rpc::{read_message, write_message, Request, Response},
    server::KvServer,
};

pub struct RpcServer<C> {
    listener: TcpListener,
    server: Arc<KvServer<C>>,
}

impl<C: Consensus> RpcServer<C> {
    pub fn new(listener: TcpListener, server: Arc<KvServer<C>>) -> Self {
        Self { listener, server }
    }

    pub async fn bind(addr: SocketAddr, server: Arc<KvServer<C>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, server))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer { listener, server } = self;
        let replica = server.me();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(replica, "rpc listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &server);
                }
            }
        }

        Ok(())
    }
}

fn handle_accept_result<C: Consensus>(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    server: &Arc<KvServer<C>>,
) {
    match result {
        Ok((stream, peer)) => {
            let server = Arc::clone(server);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &server).await {
                    warn!(peer = %peer, error = ?err, "rpc connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection<C: Consensus>(
    stream: TcpStream,
    server: &KvServer<C>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let response = match read_message::<_, Request>(&mut reader).await {
            Ok(Some(request)) => dispatch(server, request).await,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                debug!(replica = server.me(), error = %err, "malformed request");
                Response::Error {
                    message: format!("malformed request: {err}"),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {
                warn!(
                    replica = server.me(),
                    error = %err,
                    "closing connection after oversized request"
                );
                let response = Response::Error {
                    message: err.to_string(),
                };
                return write_message(&mut writer, &response).await;
            }
            Err(err) => return Err(err),
        };
        write_message(&mut writer, &response).await?;
    }
}

async fn dispatch<C: Consensus>(server: &KvServer<C>, request: Request) -> Response {
    match request {
        Request::Get(args) => Response::Get(server.get(args).await),
        Request::PutAppend(args) => Response::PutAppend(server.put_append(args).await),
    }
}
