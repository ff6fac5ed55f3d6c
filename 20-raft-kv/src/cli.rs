use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a replica group in this process with an interactive console.
    Serve(ServeArgs),
    /// Read a key from a running group.
    Get(KeyArgs),
    /// Replace the value of a key.
    Put(WriteArgs),
    /// Append to the value of a key.
    Append(WriteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Number of replicas in the group.
    #[arg(long, default_value_t = 3)]
    pub replicas: usize,

    /// Address of replica 0; replica i listens on the port shifted by i.
    /// Use port 0 for ephemeral ports.
    #[arg(long, default_value = "127.0.0.1:7100")]
    pub listen: SocketAddr,

    /// Snapshot once a replica's retained log exceeds this many bytes.
    /// Negative disables snapshotting.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub max_raft_state: i64,

    /// How long a write waits to be applied before the client is told to retry.
    #[arg(long, default_value_t = 500)]
    pub apply_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Comma-separated replica addresses, in any order.
    #[arg(long, value_delimiter = ',', required = true)]
    pub server: Vec<SocketAddr>,

    /// Bound on a single request/reply round trip.
    #[arg(long, default_value_t = 1000)]
    pub call_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    pub key: String,

    pub value: String,
}
