//! Linearizable key-value store replicated over a consensus log.
//!
//! Clients talk to a group of replicas. Writes become log entries that every
//! replica applies in the same order; reads are answered by a leader that has
//! first proven it still leads. Each clerk tags its operations with a client
//! id and an offset, so a write resent after a lost reply is applied once.
//!
//! # Modules
//!
//! - [`command`]: client ids, offsets, and the commands that travel through the log
//! - [`store`]: the key-value map, duplicate table, and snapshot payload
//! - [`consensus`]: the interface the replica needs from its consensus module
//! - [`sim`]: an in-process consensus module with fault injection
//! - [`server`]: the replica with its RPC handlers, apply loop, and snapshots
//! - [`client`]: the clerk, which retries and routes until a leader answers
//! - [`rpc`]: wire types plus JSON-line framing
//! - [`transport`]: how clerks reach replicas, in process or over TCP
//! - [`service`]: serves one replica over TCP
//! - [`cluster`]: a whole replica group in one process
//! - [`console`]: interactive shell for `raft-kv serve`
//! - [`cli`]: command-line arguments for the `raft-kv` binary

pub mod cli;
pub mod client;
pub mod cluster;
pub mod command;
pub mod consensus;
pub mod console;
pub mod error;
pub mod rpc;
pub mod server;
pub mod service;
pub mod sim;
pub mod store;
pub mod transport;
