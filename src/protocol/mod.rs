//! Wire protocol definitions for the StrataDB native driver.
//!
//! Uses MessagePack with a 4-byte big-endian length prefix for framing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Magic header sent at the start of a driver connection.
pub const STRATA_MAGIC: &[u8] = b"stratadb-drv-v1\0";

/// Maximum message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A single typed value in a result set or parameter map.
///
/// String, byte, list and struct values may be split across partial
/// result frames; numeric and boolean values never are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Struct(Vec<Value>),
}

/// Semantic kind of a value, used to choose a chunk-merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Struct,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Struct(_) => ValueKind::Struct,
        }
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ValueKind,
}

/// Result set metadata, delivered once on the first frame of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSetMetadata {
    pub columns: Vec<Column>,
}

/// One message of a streaming query response.
///
/// `values` is a flat list of already-typed values in column order,
/// spanning row boundaries. When `chunked_value` is set, the last value
/// is incomplete and continues in the next frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResultFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultSetMetadata>,

    pub values: Vec<Value>,

    #[serde(default)]
    pub chunked_value: bool,

    /// Opaque marker allowing a broken stream to be restarted from this
    /// frame boundary without data loss or duplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Vec<u8>>,
}

/// Transaction kind requested from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// A queued write applied atomically at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert {
        table: String,
        row: serde_json::Value,
    },
    Update {
        table: String,
        row: serde_json::Value,
    },
    Delete {
        table: String,
        key: serde_json::Value,
    },
}

/// Requests sent from the driver to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "req", rename_all = "snake_case")]
pub enum Request {
    /// Keep-alive. With a session name, also refreshes the server-side
    /// idle deadline for that session.
    Ping {
        #[serde(default)]
        session: Option<String>,
    },

    /// Create a server-side execution context bound to a database.
    CreateSession { database: String },

    /// Destroy a session handle.
    DeleteSession { session: String },

    /// Begin a transaction on a session.
    BeginTransaction {
        session: String,
        kind: TransactionKind,
    },

    /// Commit a transaction, applying the queued mutations atomically.
    Commit {
        session: String,
        transaction: String,
        mutations: Vec<Mutation>,
    },

    /// Roll back a transaction.
    Rollback {
        session: String,
        transaction: String,
    },

    /// Execute a SQL statement. Unary when sent via `Transport::call`,
    /// server-streaming when sent via `Transport::open_stream`.
    ExecuteSql {
        session: String,
        #[serde(default)]
        transaction: Option<String>,
        sql: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        /// Restart position for a resumed streaming call.
        #[serde(default)]
        resume_token: Option<Vec<u8>>,
    },
}

/// Error payload carried inside a `Response::Error` or stream error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

/// Server-side error classification. `Aborted` and `Unavailable` are the
/// two transient kinds the driver recovers from locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    Aborted,
    Unavailable,
    NotFound,
    FailedPrecondition,
    InvalidArgument,
    Internal,
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err.kind {
            WireErrorKind::Aborted => ClientError::Aborted(err.message),
            WireErrorKind::Unavailable => ClientError::StreamBroken(err.message),
            _ => ClientError::Server(err.message),
        }
    }
}

/// Unary responses sent from the server to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success with no payload.
    Ok,

    /// Pong response (for Ping).
    Pong { timestamp: i64 },

    /// A freshly created session handle.
    Session { name: String },

    /// A freshly begun transaction handle.
    Transaction { id: String },

    /// Successful commit.
    Commit { commit_timestamp: i64 },

    /// Complete unary result set.
    ResultSet {
        metadata: ResultSetMetadata,
        rows: Vec<Vec<Value>>,
    },

    /// Error response.
    Error { error: WireError },
}

/// Messages of a server-streaming call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum StreamMessage {
    Frame { frame: PartialResultFrame },
    End,
    Error { error: WireError },
}

/// Encode a message with a length prefix.
pub fn encode_message<T: Serialize>(msg: &T) -> ClientResult<Vec<u8>> {
    // Named serialization keeps tagged enums readable by other drivers.
    let payload = rmp_serde::to_vec_named(msg)
        .map_err(|e| ClientError::Protocol(format!("Serialization failed: {}", e)))?;

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ClientError::MessageTooLarge);
    }

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message from bytes (without the length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> ClientResult<T> {
    rmp_serde::from_slice(data)
        .map_err(|e| ClientError::Protocol(format!("Deserialization failed: {}", e)))
}
