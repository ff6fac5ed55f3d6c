//! RPC argument and reply types plus the JSON-line framing used on TCP.

use std::fmt;
use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::{ClientId, Offset, ReplicaId, WriteKind};

/// Longest frame `read_message` accepts, newline included.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

const LINE_ENDINGS: &[u8] = b"\r\n";

/// Reply code shared by both procedures.
///
/// Travels as a string so that a code from a newer replica decodes to
/// [`ErrCode::Unknown`] instead of failing the whole reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrCode {
    Ok,
    NoKey,
    WrongLeader,
    WaitForRecover,
    Unknown(String),
}

impl ErrCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrCode::Ok => "OK",
            ErrCode::NoKey => "ErrNoKey",
            ErrCode::WrongLeader => "ErrWrongLeader",
            ErrCode::WaitForRecover => "ErrWaitForRecover",
            ErrCode::Unknown(code) => code,
        }
    }
}

impl From<String> for ErrCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "OK" => ErrCode::Ok,
            "ErrNoKey" => ErrCode::NoKey,
            "ErrWrongLeader" => ErrCode::WrongLeader,
            "ErrWaitForRecover" => ErrCode::WaitForRecover,
            _ => ErrCode::Unknown(code),
        }
    }
}

impl From<ErrCode> for String {
    fn from(code: ErrCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub client_id: ClientId,
    pub offset: Offset,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub err: ErrCode,
    pub value: String,
    /// Who the replica believes leads; `None` when it has no idea.
    pub leader_id: Option<ReplicaId>,
    pub server_id: ReplicaId,
}

impl GetReply {
    /// A reply that tells the client to look elsewhere. Handlers start from
    /// this and only overwrite `err` once they have a definitive answer.
    pub fn wrong_leader(server_id: ReplicaId, leader_id: Option<ReplicaId>) -> Self {
        Self {
            err: ErrCode::WrongLeader,
            value: String::new(),
            leader_id,
            server_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub client_id: ClientId,
    pub offset: Offset,
    pub key: String,
    pub value: String,
    pub kind: WriteKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub err: ErrCode,
    pub leader_id: Option<ReplicaId>,
    pub server_id: ReplicaId,
}

impl PutAppendReply {
    pub fn wrong_leader(server_id: ReplicaId, leader_id: Option<ReplicaId>) -> Self {
        Self {
            err: ErrCode::WrongLeader,
            leader_id,
            server_id,
        }
    }
}

/// Envelope for a call sent to a replica over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Get(GetArgs),
    PutAppend(PutAppendArgs),
}

/// Envelope for a replica's answer over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Get(GetReply),
    PutAppend(PutAppendReply),
    /// The request could not be understood.
    Error { message: String },
}

/// Reads one JSON line, skipping blank ones. `Ok(None)` means end of stream.
///
/// A line that does not parse fails with `InvalidData`; the stream stays
/// usable. A line longer than [`MAX_MESSAGE_BYTES`] fails with
/// `InvalidInput` and leaves the stream mid-line.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_MESSAGE_BYTES as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes == MAX_MESSAGE_BYTES && line.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message longer than {MAX_MESSAGE_BYTES} bytes"),
            ));
        }

        let end = line
            .iter()
            .rposition(|b| !LINE_ENDINGS.contains(b))
            .map_or(0, |last| last + 1);
        if end == 0 {
            continue;
        }

        let parsed = serde_json::from_slice(&line[..end]).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
