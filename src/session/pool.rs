//! Bounded session pool with FIFO wait queue and background maintenance.
//!
//! The pool owns every `Session` it hands out. All bookkeeping (idle set,
//! checked-out map, wait queue, in-flight creation count) lives behind one
//! mutex; waiters suspend on a `oneshot` channel so no caller ever sleeps
//! while holding the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::SessionPoolConfig;
use crate::error::{ClientError, ClientResult, LeakedSession};
use crate::protocol::{Request, Response, TransactionKind};
use crate::rpc::Transport;
use crate::session::{Session, SessionKind};

struct CheckedOut {
    kind: SessionKind,
    acquired_at: Instant,
    tag: Option<String>,
}

struct Waiter {
    id: u64,
    kind: SessionKind,
    tag: Option<String>,
    tx: oneshot::Sender<Session>,
}

#[derive(Default)]
struct PoolInner {
    idle: VecDeque<Session>,
    checked_out: HashMap<String, CheckedOut>,
    waiters: VecDeque<Waiter>,
    in_flight_creates: usize,
    closed: bool,
    next_waiter_id: u64,
}

impl PoolInner {
    /// Sessions the pool currently accounts for. Never exceeds
    /// `max_sessions`.
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.in_flight_creates
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub in_flight_creates: usize,
    pub waiters: usize,
}

/// A bounded pool of StrataDB sessions shared by all callers of one
/// `Database`.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    database: String,
    config: SessionPoolConfig,
    inner: Mutex<PoolInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Open a pool and start its background maintenance task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        transport: Arc<dyn Transport>,
        database: impl Into<String>,
        config: SessionPoolConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            transport,
            database: database.into(),
            config,
            inner: Mutex::new(PoolInner::default()),
            maintenance: Mutex::new(None),
        });
        pool.spawn_maintenance();
        pool
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionPoolStats {
        let inner = self.inner.lock();
        SessionPoolStats {
            idle: inner.idle.len(),
            checked_out: inner.checked_out.len(),
            in_flight_creates: inner.in_flight_creates,
            waiters: inner.waiters.len(),
        }
    }

    /// Check a session out of the pool.
    ///
    /// Serves from the idle set when possible, creates a new session when
    /// below `max_sessions`, and otherwise queues FIFO behind earlier
    /// waiters until a release frees a session or `acquire_timeout`
    /// elapses.
    pub async fn acquire(&self, kind: SessionKind) -> ClientResult<Session> {
        self.acquire_tagged(kind, None).await
    }

    /// Like [`acquire`](Self::acquire), with a tag recorded in the leak
    /// report if the session is never released.
    ///
    /// A parked waiter can be woken without a session when capacity frees
    /// up some other way (a creation on its behalf failed); it then
    /// re-plans against current pool state, re-queueing at the front so
    /// arrival order is preserved. The overall deadline spans all such
    /// retries.
    pub async fn acquire_tagged(
        &self,
        kind: SessionKind,
        tag: Option<String>,
    ) -> ClientResult<Session> {
        enum Plan {
            Ready(Session),
            Create,
            Wait(oneshot::Receiver<Session>, u64),
        }

        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut woken_to_retry = false;

        loop {
            let plan = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(ClientError::PoolClosed);
                }

                if let Some(mut session) = Self::take_idle(&mut inner.idle, kind) {
                    session.mark_used();
                    inner.checked_out.insert(
                        session.name().to_string(),
                        CheckedOut {
                            kind,
                            acquired_at: Instant::now(),
                            tag: tag.clone(),
                        },
                    );
                    Plan::Ready(session)
                } else if inner.total() < self.config.max_sessions {
                    inner.in_flight_creates += 1;
                    Plan::Create
                } else {
                    let id = inner.next_waiter_id;
                    inner.next_waiter_id += 1;
                    let (wtx, wrx) = oneshot::channel();
                    let waiter = Waiter {
                        id,
                        kind,
                        tag: tag.clone(),
                        tx: wtx,
                    };
                    if woken_to_retry {
                        inner.waiters.push_front(waiter);
                    } else {
                        inner.waiters.push_back(waiter);
                    }
                    Plan::Wait(wrx, id)
                }
            };

            match plan {
                Plan::Ready(session) => return Ok(session),
                Plan::Create => {
                    // Creation failures surface to the caller and never
                    // count against the pool.
                    let created = self.create_session().await;
                    let mut inner = self.inner.lock();
                    inner.in_flight_creates -= 1;
                    return match created {
                        Ok(session) => {
                            if inner.closed {
                                drop(inner);
                                self.delete_in_background(session);
                                return Err(ClientError::PoolClosed);
                            }
                            inner.checked_out.insert(
                                session.name().to_string(),
                                CheckedOut {
                                    kind,
                                    acquired_at: Instant::now(),
                                    tag,
                                },
                            );
                            Ok(session)
                        }
                        Err(e) => {
                            // The slot this creation held is free again;
                            // wake the head waiter so it can claim it
                            // instead of sleeping out its timeout.
                            Self::promote_waiter(&mut inner);
                            Err(e)
                        }
                    };
                }
                Plan::Wait(mut wrx, id) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, &mut wrx).await {
                        Ok(Ok(session)) => return Ok(session),
                        Ok(Err(_)) => {
                            if self.inner.lock().closed {
                                return Err(ClientError::PoolClosed);
                            }
                            // Woken without a session: capacity freed up,
                            // go around and claim it.
                            woken_to_retry = true;
                        }
                        Err(_elapsed) => {
                            let mut inner = self.inner.lock();
                            if let Some(pos) = inner.waiters.iter().position(|w| w.id == id) {
                                inner.waiters.remove(pos);
                                return Err(ClientError::PoolExhausted(
                                    self.config.acquire_timeout,
                                ));
                            }
                            drop(inner);
                            // A release served us under its lock just as
                            // the timer fired; the session is already in
                            // the channel and already checked out to us.
                            match wrx.try_recv() {
                                Ok(session) => return Ok(session),
                                Err(_) => {
                                    let mut inner = self.inner.lock();
                                    if inner.closed {
                                        return Err(ClientError::PoolClosed);
                                    }
                                    // Promoted just as the timer fired;
                                    // pass the wake-up on before giving up.
                                    Self::promote_waiter(&mut inner);
                                    return Err(ClientError::PoolExhausted(
                                        self.config.acquire_timeout,
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Return a checked-out session to the pool.
    ///
    /// Hands it directly to the longest-waiting acquire if one is queued,
    /// otherwise back to the idle set. After close, the session is
    /// destroyed instead.
    pub fn release(&self, mut session: Session) {
        let mut inner = self.inner.lock();
        inner.checked_out.remove(session.name());

        if inner.closed {
            drop(inner);
            self.delete_in_background(session);
            return;
        }

        session.mark_used();
        Self::route(&mut inner, session);
    }

    /// Descriptors for sessions currently checked out. At shutdown these
    /// are the sessions that were never released.
    pub fn get_leaks(&self) -> Vec<LeakedSession> {
        let inner = self.inner.lock();
        inner
            .checked_out
            .iter()
            .map(|(name, meta)| LeakedSession {
                name: name.clone(),
                held_for: meta.acquired_at.elapsed(),
                tag: meta.tag.clone(),
            })
            .collect()
    }

    /// Close the pool: stop maintenance, fail queued waiters with
    /// `PoolClosed`, destroy idle sessions, and report sessions never
    /// released as a non-fatal `SessionLeak` aggregate.
    pub async fn close(&self) -> ClientResult<()> {
        let (idle, leaks) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            // Dropping the senders resolves every waiter with PoolClosed.
            inner.waiters.clear();
            let idle: Vec<Session> = inner.idle.drain(..).collect();
            let leaks: Vec<LeakedSession> = inner
                .checked_out
                .iter()
                .map(|(name, meta)| LeakedSession {
                    name: name.clone(),
                    held_for: meta.acquired_at.elapsed(),
                    tag: meta.tag.clone(),
                })
                .collect();
            (idle, leaks)
        };

        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }

        for session in idle {
            if let Err(e) = self.delete_session(session.name()).await {
                tracing::warn!("Failed to delete session {}: {}", session.name(), e);
            }
        }

        if leaks.is_empty() {
            tracing::debug!("Session pool for '{}' closed", self.database);
            Ok(())
        } else {
            tracing::warn!(
                "Session pool for '{}' closed with {} leaked session(s)",
                self.database,
                leaks.len()
            );
            Err(ClientError::SessionLeak(leaks))
        }
    }

    /// Pick an idle session compatible with `kind`. Read-write checkouts
    /// prefer a session with a prepared transaction handle.
    fn take_idle(idle: &mut VecDeque<Session>, kind: SessionKind) -> Option<Session> {
        if kind == SessionKind::ReadWrite {
            if let Some(pos) = idle.iter().rposition(|s| s.cached_transaction().is_some()) {
                return idle.remove(pos);
            }
        }
        idle.pop_back()
    }

    /// Wake the longest-waiting live acquire without a session, so it can
    /// retry its plan against freed capacity. Dropping a waiter's sender
    /// resumes it; `acquire_tagged` tells this wake-up apart from close by
    /// checking the `closed` flag.
    fn promote_waiter(inner: &mut PoolInner) {
        while let Some(waiter) = inner.waiters.pop_front() {
            if !waiter.tx.is_closed() {
                return;
            }
        }
    }

    /// Hand a session to the head of the wait queue, skipping waiters
    /// whose acquire was cancelled, or park it in the idle set.
    fn route(inner: &mut PoolInner, mut session: Session) {
        while let Some(waiter) = inner.waiters.pop_front() {
            inner.checked_out.insert(
                session.name().to_string(),
                CheckedOut {
                    kind: waiter.kind,
                    acquired_at: Instant::now(),
                    tag: waiter.tag,
                },
            );
            match waiter.tx.send(session) {
                Ok(()) => return,
                Err(returned) => {
                    session = returned;
                    inner.checked_out.remove(session.name());
                }
            }
        }
        inner.idle.push_back(session);
    }

    async fn create_session(&self) -> ClientResult<Session> {
        let response = self
            .transport
            .call(Request::CreateSession {
                database: self.database.clone(),
            })
            .await?;
        match response {
            Response::Session { name } => Ok(Session::new(name)),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to CreateSession: {:?}",
                other
            ))),
        }
    }

    async fn delete_session(&self, name: &str) -> ClientResult<()> {
        self.transport
            .call(Request::DeleteSession {
                session: name.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Best-effort remote deletion for paths that cannot await. A failed
    /// deletion is logged; the session is already out of all bookkeeping.
    fn delete_in_background(&self, session: Session) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let name = session.name().to_string();
            if let Err(e) = transport
                .call(Request::DeleteSession {
                    session: name.clone(),
                })
                .await
            {
                tracing::warn!("Failed to delete session {}: {}", name, e);
            }
        });
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.run_maintenance().await;
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    /// One maintenance pass: evict stale idle sessions, replenish to the
    /// minimum, keep near-expiry sessions alive, and pre-begin write
    /// transactions on a share of idle sessions.
    pub(crate) async fn run_maintenance(&self) {
        self.evict_idle().await;
        self.replenish().await;
        self.keepalive().await;
        self.prepare_write_sessions().await;
    }

    async fn evict_idle(&self) {
        let expired: Vec<Session> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let mut removable = inner.total().saturating_sub(self.config.min_sessions);
            let mut expired = Vec::new();
            // Oldest idle sessions sit at the front of the deque.
            while removable > 0 {
                let stale = matches!(
                    inner.idle.front(),
                    Some(s) if s.last_used_at().elapsed() >= self.config.idle_timeout
                );
                if !stale {
                    break;
                }
                if let Some(s) = inner.idle.pop_front() {
                    expired.push(s);
                    removable -= 1;
                }
            }
            expired
        };

        for session in expired {
            tracing::debug!("Evicting idle session {}", session.name());
            if let Err(e) = self.delete_session(session.name()).await {
                tracing::warn!("Failed to delete session {}: {}", session.name(), e);
            }
        }
    }

    async fn replenish(&self) {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed || inner.total() >= self.config.min_sessions {
                    return;
                }
                inner.in_flight_creates += 1;
            }

            let created = self.create_session().await;
            let mut inner = self.inner.lock();
            inner.in_flight_creates -= 1;
            match created {
                Ok(session) => {
                    if inner.closed {
                        drop(inner);
                        self.delete_in_background(session);
                        return;
                    }
                    Self::route(&mut inner, session);
                }
                Err(e) => {
                    drop(inner);
                    tracing::warn!("Session replenishment failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn keepalive(&self) {
        let due: Vec<String> = {
            let inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner
                .idle
                .iter()
                .filter(|s| s.last_used_at().elapsed() >= self.config.keepalive_interval)
                .map(|s| s.name().to_string())
                .collect()
        };

        for name in due {
            match self
                .transport
                .call(Request::Ping {
                    session: Some(name.clone()),
                })
                .await
            {
                Ok(_) => {
                    let mut inner = self.inner.lock();
                    if let Some(s) = inner.idle.iter_mut().find(|s| s.name() == name) {
                        s.mark_used();
                    }
                }
                Err(e) => tracing::warn!("Keepalive for session {} failed: {}", name, e),
            }
        }
    }

    async fn prepare_write_sessions(&self) {
        let unprepared: Vec<String> = {
            let inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let target =
                (inner.idle.len() as f64 * self.config.write_fraction).floor() as usize;
            let prepared = inner
                .idle
                .iter()
                .filter(|s| s.cached_transaction().is_some())
                .count();
            inner
                .idle
                .iter()
                .filter(|s| s.cached_transaction().is_none())
                .take(target.saturating_sub(prepared))
                .map(|s| s.name().to_string())
                .collect()
        };

        for name in unprepared {
            let response = self
                .transport
                .call(Request::BeginTransaction {
                    session: name.clone(),
                    kind: TransactionKind::ReadWrite,
                })
                .await;
            match response {
                Ok(Response::Transaction { id }) => {
                    let mut inner = self.inner.lock();
                    match inner.idle.iter_mut().find(|s| s.name() == name) {
                        Some(s) => s.set_cached_transaction(id),
                        // Checked out while we were preparing; the handle
                        // is abandoned and expires server-side.
                        None => tracing::debug!(
                            "Session {} left the idle set during preparation",
                            name
                        ),
                    }
                }
                Ok(other) => tracing::warn!(
                    "Unexpected response preparing session {}: {:?}",
                    name,
                    other
                ),
                Err(e) => tracing::debug!("Preparing write session {} failed: {}", name, e),
            }
        }
    }
}
