//! Commands that flow through the replicated log, and the identifiers that
//! tag them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-client sequence number. Starts at 1 and grows after every
/// acknowledged operation.
pub type Offset = u64;

/// Position of an entry in the consensus log.
pub type LogIndex = u64;

/// Consensus term (election epoch).
pub type Term = u64;

/// Identifier a replica reports about itself in every reply.
pub type ReplicaId = usize;

/// Random identifier chosen once per client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Draws a fresh 63-bit identifier.
    pub fn random() -> Self {
        Self(rand::random::<u64>() >> 1)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The two mutating operations a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Put,
    Append,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::Put => f.write_str("Put"),
            WriteKind::Append => f.write_str("Append"),
        }
    }
}

/// A command proposed to the consensus module.
///
/// Reads are answered by the leader after a leadership check and never
/// appear here. `NoOp` only exists to get an entry of the current term
/// committed after a leader change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Write {
        client_id: ClientId,
        offset: Offset,
        kind: WriteKind,
        key: String,
        value: String,
    },
    NoOp,
}

impl Command {
    pub fn put(
        client_id: ClientId,
        offset: Offset,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Command::Write {
            client_id,
            offset,
            kind: WriteKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn append(
        client_id: ClientId,
        offset: Offset,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Command::Write {
            client_id,
            offset,
            kind: WriteKind::Append,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Size of the command once serialized into the log.
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |len| len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_fit_in_63_bits() {
        for _ in 0..64 {
            assert!(ClientId::random().0 < 1 << 63);
        }
    }

    #[test]
    fn encoded_len_grows_with_payload() {
        let client = ClientId(7);
        let small = Command::put(client, 1, "k", "v");
        let large = Command::put(client, 1, "k", "v".repeat(100));
        assert!(small.encoded_len() > 0);
        assert!(large.encoded_len() > small.encoded_len());
        assert!(Command::NoOp.encoded_len() < small.encoded_len());
    }
}
