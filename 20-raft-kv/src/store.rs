//! Replica-local state: the key-value map, the duplicate table, and the
//! snapshot payload that captures both.
//!
//! Nothing in here is synchronized. The replica keeps all of it behind a
//! single mutex and only the apply loop mutates it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::command::{ClientId, Command, Offset, WriteKind};
use crate::error::{KvError, KvResult};

/// The replicated key-value map.
///
/// `BTreeMap` keeps iteration order deterministic, so two replicas with the
/// same contents produce byte-identical snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Overwrites any existing value.
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Concatenates onto the existing value, treating a missing key as empty.
    pub fn append(&mut self, key: String, value: &str) {
        self.data.entry(key).or_default().push_str(value);
    }

    pub fn apply(&mut self, kind: WriteKind, key: String, value: String) {
        match kind {
            WriteKind::Put => self.put(key, value),
            WriteKind::Append => self.append(key, &value),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Where a client's offset stands relative to what has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Older than the last applied offset; superseded by a newer request.
    Stale,
    /// Exactly the last applied offset; a retry of an acknowledged write.
    Applied,
    /// Not applied yet.
    Fresh,
}

/// Last applied offset per client.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DuplicateTable {
    last_applied: HashMap<ClientId, Offset>,
}

impl DuplicateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last applied offset for `client`, or 0 if none.
    pub fn last_applied(&self, client: ClientId) -> Offset {
        self.last_applied.get(&client).copied().unwrap_or(0)
    }

    pub fn classify(&self, client: ClientId, offset: Offset) -> Freshness {
        let last = self.last_applied(client);
        if offset < last {
            Freshness::Stale
        } else if offset == last {
            Freshness::Applied
        } else {
            Freshness::Fresh
        }
    }

    /// Records `offset` as applied. A recorded offset never decreases.
    pub fn record(&mut self, client: ClientId, offset: Offset) {
        let entry = self.last_applied.entry(client).or_insert(0);
        if offset > *entry {
            *entry = offset;
        }
    }

    pub fn len(&self) -> usize {
        self.last_applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_applied.is_empty()
    }
}

/// The deterministic state machine driven by committed commands: the
/// key-value map plus the duplicate table. It is also the snapshot payload.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    pub duplicates: DuplicateTable,
    pub data: KvStore,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed command. Returns false when the command was a
    /// no-op or a write this client already had applied.
    pub fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::NoOp => false,
            Command::Write {
                client_id,
                offset,
                kind,
                key,
                value,
            } => {
                if self.duplicates.classify(client_id, offset) != Freshness::Fresh {
                    return false;
                }
                self.data.apply(kind, key, value);
                self.duplicates.record(client_id, offset);
                true
            }
        }
    }

    pub fn encode(&self) -> KvResult<Vec<u8>> {
        bincode::serialize(self).map_err(KvError::Codec)
    }

    /// Decodes a payload. An empty payload means no snapshot was ever taken.
    pub fn decode(bytes: &[u8]) -> KvResult<Option<Self>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        bincode::deserialize(bytes)
            .map(Some)
            .map_err(KvError::CorruptSnapshot)
    }
}
