use std::time::Duration;

use thiserror::Error;

/// Descriptor for a session that was still checked out when the pool closed.
#[derive(Debug, Clone)]
pub struct LeakedSession {
    /// Remote session name.
    pub name: String,
    /// How long the session had been checked out at close time.
    pub held_for: Duration,
    /// Optional tag supplied at acquisition, for attributing the leak.
    pub tag: Option<String>,
}

impl std::fmt::Display for LeakedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{} (held {:?}, tag: {})", self.name, self.held_for, tag),
            None => write!(f, "{} (held {:?})", self.name, self.held_for),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Connection or I/O failure talking to the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large")]
    MessageTooLarge,

    /// The server aborted the transaction due to a serializability
    /// conflict. Retried transparently by the transaction runner.
    #[error("Transaction aborted: {0}")]
    Aborted(String),

    /// A streaming call broke in a way the server allows resuming from.
    /// Retried transparently by the row stream via its resume token.
    #[error("Stream interrupted: {0}")]
    StreamBroken(String),

    /// Any other server-reported failure. Never retried.
    #[error("Server error: {0}")]
    Server(String),

    /// No session became available within the acquire timeout.
    #[error("Session pool exhausted: no session available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A value could not be encoded for, or decoded from, the wire.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Non-fatal aggregate reported by `SessionPool::close` when sessions
    /// were never released. Shutdown still completes.
    #[error("{} session(s) never released before pool close", .0.len())]
    SessionLeak(Vec<LeakedSession>),
}

impl ClientError {
    /// True for the one error class the transaction runner retries.
    pub fn is_aborted(&self) -> bool {
        matches!(self, ClientError::Aborted(_))
    }

    /// True for transport interruptions a streaming call may resume from.
    pub fn is_retryable_stream_break(&self) -> bool {
        matches!(self, ClientError::StreamBroken(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
