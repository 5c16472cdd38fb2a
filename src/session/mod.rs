//! Session handles and the session pool.

use std::time::Instant;

pub mod pool;

pub use pool::{SessionPool, SessionPoolStats};

/// What a caller intends to do with an acquired session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Read,
    ReadWrite,
}

/// A lightweight handle to a server-side execution context.
///
/// Passive record: no network calls originate here. Owned by exactly one
/// `SessionPool`, and by exactly one caller while checked out.
#[derive(Debug)]
pub struct Session {
    name: String,
    created_at: Instant,
    last_used_at: Instant,
    /// Lazily prepared read-write transaction handle, consumed by the
    /// next read-write checkout.
    cached_transaction: Option<String>,
}

impl Session {
    pub(crate) fn new(name: String) -> Self {
        let now = Instant::now();
        Self {
            name,
            created_at: now,
            last_used_at: now,
            cached_transaction: None,
        }
    }

    /// Remote session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Record that the session was just used (refreshes eviction and
    /// keepalive clocks).
    pub(crate) fn mark_used(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub(crate) fn cached_transaction(&self) -> Option<&str> {
        self.cached_transaction.as_deref()
    }

    pub(crate) fn set_cached_transaction(&mut self, id: String) {
        self.cached_transaction = Some(id);
    }

    pub(crate) fn take_cached_transaction(&mut self) -> Option<String> {
        self.cached_transaction.take()
    }
}
