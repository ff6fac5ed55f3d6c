//! Error taxonomy for the replicated key-value store.
//!
//! Retryable conditions (lost RPCs, `WrongLeader`, `WaitForRecover`, apply
//! timeouts) never show up here: the [`crate::client::Clerk`] absorbs them.
//! What remains are outcomes the caller cannot fix by retrying.

use thiserror::Error;

use crate::command::LogIndex;

/// Result type for key-value operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors surfaced by the client router and the replica.
#[derive(Debug, Error)]
pub enum KvError {
    /// A replica answered with something this client does not understand.
    ///
    /// Indicates a version mismatch between client and replica, never an
    /// ordinary runtime condition.
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// A snapshot payload could not be decoded.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(#[source] bincode::Error),

    /// Replica state could not be encoded into a snapshot.
    #[error("snapshot encoding failed: {0}")]
    Codec(#[source] bincode::Error),

    /// The committed-entry stream skipped past the next index.
    #[error("apply stream jumped from index {last_applied} to {index}")]
    ApplyGap {
        last_applied: LogIndex,
        index: LogIndex,
    },

    /// A clerk was built over a transport that addresses no replicas.
    #[error("no replicas configured")]
    NoReplicas,
}

impl KvError {
    /// Creates a protocol violation error.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }
}
