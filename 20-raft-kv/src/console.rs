//! Interactive shell for `raft-kv serve`.
//!
//! [`ConsoleCommand`] parses one line of input. [`Console`] owns the local
//! cluster, a clerk to drive it, and the TCP listener of every running
//! replica, and turns commands into printable output.

use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{error::Elapsed, timeout},
};
use tracing::{info, warn};

use crate::{
    cluster::{LocalClerk, LocalCluster},
    command::ReplicaId,
    error::KvResult,
    service::RpcServer,
};

/// How long one console operation may keep retrying before giving up.
const CLERK_DEADLINE: Duration = Duration::from_secs(10);

pub const HELP: &str = "\
Commands (case-insensitive):
  PUT/p <key> <value>     replace the value of a key
  APPEND/a <key> <value>  append to the value of a key
  GET/g <key>             read a key through the cluster
  STATUS/s                show every replica
  CAMPAIGN/c <replica>    make a replica the leader of a new term
  CRASH/x <replica>       kill a replica, keeping its snapshot
  RESTART/r <replica>     boot a replica from its snapshot
  HELP/h                  print this reference
  EXIT/e                  stop the cluster";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Append { key: String, value: String },
    Get { key: String },
    Status,
    Campaign { replica: ReplicaId },
    Crash { replica: ReplicaId },
    Restart { replica: ReplicaId },
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses a line of user input. Keywords are case-insensitive and each
    /// has a one-letter alias; keys and values are taken verbatim.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "A" => "APPEND",
            "G" => "GET",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "X" => "CRASH",
            "R" => "RESTART",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("STATUS", 1) => Ok(ConsoleCommand::Status),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("APPEND", 3) => Ok(ConsoleCommand::Append {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("CAMPAIGN", 2) => Ok(ConsoleCommand::Campaign {
                replica: parse_replica(parts[1])?,
            }),
            ("CRASH", 2) => Ok(ConsoleCommand::Crash {
                replica: parse_replica(parts[1])?,
            }),
            ("RESTART", 2) => Ok(ConsoleCommand::Restart {
                replica: parse_replica(parts[1])?,
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT" | "APPEND", _) => Err(anyhow!(
                "{normalized_cmd} requires exactly two arguments: {normalized_cmd} <key> <value>"
            )),
            ("CAMPAIGN" | "CRASH" | "RESTART", _) => Err(anyhow!(
                "{normalized_cmd} requires exactly one argument: {normalized_cmd} <replica>"
            )),
            ("EXIT" | "HELP" | "STATUS", _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p, APPEND/a, GET/g, STATUS/s, CAMPAIGN/c, CRASH/x, RESTART/r, HELP/h, EXIT/e"
            )),
        }
    }
}

fn parse_replica(raw: &str) -> Result<ReplicaId> {
    raw.parse::<ReplicaId>()
        .with_context(|| format!("replica must be a number, got {raw:?}"))
}

/// What the caller should do after a command ran.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Print(String),
    Exit,
}

struct Listener {
    addr: SocketAddr,
    running: Option<(oneshot::Sender<()>, JoinHandle<Result<()>>)>,
}

pub struct Console {
    cluster: LocalCluster,
    clerk: LocalClerk,
    listeners: Vec<Listener>,
}

impl Console {
    /// Exposes replica `i` on `base` with its port shifted by `i`. A base
    /// port of 0 lets the OS pick every port.
    pub async fn start(cluster: LocalCluster, base: SocketAddr) -> Result<Self> {
        let mut listeners = Vec::with_capacity(cluster.len());
        for id in 0..cluster.len() {
            let mut addr = base;
            if base.port() != 0 {
                let port = u16::try_from(usize::from(base.port()) + id)
                    .context("replica port out of range")?;
                addr.set_port(port);
            }
            let mut listener = Listener {
                addr,
                running: None,
            };
            listen(&cluster, id, &mut listener).await?;
            listeners.push(listener);
        }
        let clerk = cluster.clerk();
        Ok(Self {
            cluster,
            clerk,
            listeners,
        })
    }

    /// Addresses clients can reach each replica on.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    pub async fn execute(&mut self, command: ConsoleCommand) -> Result<Outcome> {
        let output = match command {
            ConsoleCommand::Put { key, value } => {
                let done = timeout(CLERK_DEADLINE, self.clerk.put(&key, &value)).await;
                self.settle(done)?;
                format!("OK {key} = {value}")
            }
            ConsoleCommand::Append { key, value } => {
                let done = timeout(CLERK_DEADLINE, self.clerk.append(&key, &value)).await;
                self.settle(done)?;
                format!("OK appended to {key}")
            }
            ConsoleCommand::Get { key } => {
                let done = timeout(CLERK_DEADLINE, self.clerk.get(&key)).await;
                let value = self.settle(done)?;
                format!("{key} = {value:?}")
            }
            ConsoleCommand::Status => self.status(),
            ConsoleCommand::Campaign { replica } => {
                self.check_replica(replica)?;
                self.cluster.elect(replica)?;
                format!("replica {replica} leads term {}", self.cluster.term())
            }
            ConsoleCommand::Crash { replica } => {
                self.check_replica(replica)?;
                self.stop_listener(replica).await;
                self.cluster.crash(replica);
                format!("replica {replica} crashed")
            }
            ConsoleCommand::Restart { replica } => {
                self.check_replica(replica)?;
                self.stop_listener(replica).await;
                self.cluster.restart(replica)?;
                listen(&self.cluster, replica, &mut self.listeners[replica]).await?;
                format!("replica {replica} restarted")
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Exit => return Ok(Outcome::Exit),
        };
        Ok(Outcome::Print(output))
    }

    /// Unwraps a clerk call that ran under [`CLERK_DEADLINE`].
    ///
    /// A clerk that gave up mid-operation may have had its write applied
    /// without learning so, and its next operation would reuse the same
    /// offset. It is replaced by a fresh clerk instead.
    fn settle<T>(&mut self, done: Result<KvResult<T>, Elapsed>) -> Result<T> {
        match done {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.clerk = self.cluster.clerk();
                bail!("no leader answered within {CLERK_DEADLINE:?}; is a leader elected with a majority up?")
            }
        }
    }

    fn check_replica(&self, replica: ReplicaId) -> Result<()> {
        if replica >= self.cluster.len() {
            bail!(
                "no replica {replica}; this cluster has replicas 0..{}",
                self.cluster.len()
            );
        }
        Ok(())
    }

    fn status(&self) -> String {
        let mut out = format!(
            "term {} leader {} commit {}",
            self.cluster.term(),
            self.cluster
                .leader()
                .map_or_else(|| "none".to_string(), |id| id.to_string()),
            self.cluster.commit_index()
        );
        for (row, listener) in self.cluster.status().iter().zip(&self.listeners) {
            out.push_str(&format!(
                "\n  replica {} {:<4} {:<6} applied={} keys={} snapshot={} log={}B addr={}",
                row.id,
                if row.alive { "up" } else { "down" },
                if row.leader { "leader" } else { "" },
                row.last_applied,
                row.keys,
                row.snapshot_index,
                row.log_bytes,
                listener.addr,
            ));
        }
        out
    }

    async fn stop_listener(&mut self, replica: ReplicaId) {
        let Some((shutdown, handle)) = self.listeners[replica].running.take() else {
            return;
        };
        let _ = shutdown.send(());
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(replica, error = ?err, "rpc listener failed"),
            Err(err) => warn!(replica, error = ?err, "rpc listener task panicked"),
        }
    }

    /// Stops every listener and replica.
    pub async fn shutdown(mut self) {
        for replica in 0..self.listeners.len() {
            self.stop_listener(replica).await;
        }
        self.cluster.shutdown();
    }
}

async fn listen(cluster: &LocalCluster, id: ReplicaId, listener: &mut Listener) -> Result<()> {
    let server = cluster
        .server(id)
        .ok_or_else(|| anyhow!("replica {id} is not running"))?;
    let rpc = RpcServer::bind(listener.addr, server)
        .await
        .with_context(|| format!("failed to bind {}", listener.addr))?;
    listener.addr = rpc.local_addr()?;
    info!(replica = id, addr = %listener.addr, "replica listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(rpc.run_until(async {
        let _ = shutdown_rx.await;
    }));
    listener.running = Some((shutdown_tx, handle));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_case_insensitive() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("Status"), Ok(ConsoleCommand::Status)));
        assert!(matches!(
            ConsoleCommand::parse("AppEnd k v"),
            Ok(ConsoleCommand::Append { key, value }) if key == "k" && value == "v"
        ));
    }

    #[test]
    fn aliases_expand() {
        assert_eq!(
            ConsoleCommand::parse("p KEY VAL").unwrap(),
            ConsoleCommand::Put {
                key: "KEY".into(),
                value: "VAL".into()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("g foo").unwrap(),
            ConsoleCommand::Get { key: "foo".into() }
        );
        assert_eq!(
            ConsoleCommand::parse("c 2").unwrap(),
            ConsoleCommand::Campaign { replica: 2 }
        );
        assert_eq!(
            ConsoleCommand::parse("X 0").unwrap(),
            ConsoleCommand::Crash { replica: 0 }
        );
        assert_eq!(
            ConsoleCommand::parse("r 1").unwrap(),
            ConsoleCommand::Restart { replica: 1 }
        );
        assert_eq!(ConsoleCommand::parse("h").unwrap(), ConsoleCommand::Help);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("GET").is_err());
        assert!(ConsoleCommand::parse("PUT key").is_err());
        assert!(ConsoleCommand::parse("append k v extra").is_err());
        assert!(ConsoleCommand::parse("crash one").is_err());
        assert!(ConsoleCommand::parse("status now").is_err());
    }

    #[tokio::test]
    async fn console_drives_a_cluster() {
        use crate::server::ServerConfig;

        let cluster = LocalCluster::start(3, ServerConfig::default()).unwrap();
        cluster.elect(0).unwrap();
        let base: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut console = Console::start(cluster, base).await.unwrap();
        assert_eq!(console.addrs().len(), 3);

        for line in ["put x 1", "append x a"] {
            let command = ConsoleCommand::parse(line).unwrap();
            assert!(matches!(console.execute(command).await.unwrap(), Outcome::Print(_)));
        }
        let output = console
            .execute(ConsoleCommand::Get { key: "x".into() })
            .await
            .unwrap();
        assert_eq!(output, Outcome::Print("x = \"1a\"".into()));

        console.execute(ConsoleCommand::Restart { replica: 1 }).await.unwrap();
        assert!(console
            .execute(ConsoleCommand::Crash { replica: 7 })
            .await
            .is_err());
        assert_eq!(console.execute(ConsoleCommand::Exit).await.unwrap(), Outcome::Exit);
        console.shutdown().await;
    }
}
