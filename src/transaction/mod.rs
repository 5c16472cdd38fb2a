//! Transactions and the abort-retry runner.
//!
//! StrataDB aborts a read-write transaction whenever it loses a conflict,
//! and expects the client to replay the whole body against a fresh
//! transaction. [`TransactionRunner::run`] owns that loop: acquire a
//! session, begin, run the body, commit, and on `Aborted` back off and
//! start over until the commit lands, the deadline passes, or the retry
//! budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use crate::config::RetryConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{Mutation, Request, Response, TransactionKind, Value};
use crate::rpc::Transport;
use crate::session::{Session, SessionKind, SessionPool};
use crate::stream::Row;

/// Per-call knobs for [`TransactionRunner::run`].
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Read-only transactions take a consistent snapshot, never conflict,
    /// and skip the commit round-trip.
    pub read_only: bool,
    /// Wall-clock budget across all attempts, backoff included. `None`
    /// retries indefinitely.
    pub timeout: Option<Duration>,
}

/// A single attempt at a transaction, bound to one pooled session.
///
/// Handed to the body closure by [`TransactionRunner::run`], or obtained
/// directly from `Database::transaction` for manual control. The session
/// returns to the pool on commit, rollback, or drop.
pub struct Transaction {
    transport: Arc<dyn Transport>,
    pool: Arc<SessionPool>,
    session: Option<Session>,
    id: String,
    read_only: bool,
    mutations: Vec<Mutation>,
}

impl Transaction {
    /// Begin a transaction on an already-acquired session.
    ///
    /// Read-write transactions consume the session's prepared handle when
    /// maintenance left one; otherwise (and always for read-only) a
    /// `BeginTransaction` round-trip is made. The session goes back to the
    /// pool if that call fails.
    pub(crate) async fn start(
        transport: Arc<dyn Transport>,
        pool: Arc<SessionPool>,
        mut session: Session,
        read_only: bool,
    ) -> ClientResult<Self> {
        let cached = if read_only {
            None
        } else {
            session.take_cached_transaction()
        };

        let id = match cached {
            Some(id) => id,
            None => {
                let kind = if read_only {
                    TransactionKind::ReadOnly
                } else {
                    TransactionKind::ReadWrite
                };
                let request = Request::BeginTransaction {
                    session: session.name().to_string(),
                    kind,
                };
                match transport.call(request).await {
                    Ok(Response::Transaction { id }) => id,
                    Ok(other) => {
                        pool.release(session);
                        return Err(ClientError::Protocol(format!(
                            "Unexpected response to BeginTransaction: {:?}",
                            other
                        )));
                    }
                    Err(e) => {
                        pool.release(session);
                        return Err(e);
                    }
                }
            }
        };

        Ok(Self {
            transport,
            pool,
            session: Some(session),
            id,
            read_only,
            mutations: Vec::new(),
        })
    }

    /// Server-side transaction id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn session_name(&self) -> ClientResult<String> {
        self.session
            .as_ref()
            .map(|s| s.name().to_string())
            .ok_or(ClientError::Protocol(
                "Transaction already finished".to_string(),
            ))
    }

    /// Execute a SQL statement inside this transaction and collect the
    /// full result set.
    pub async fn run(
        &mut self,
        sql: &str,
        params: HashMap<String, Value>,
    ) -> ClientResult<Vec<Row>> {
        let request = Request::ExecuteSql {
            session: self.session_name()?,
            transaction: Some(self.id.clone()),
            sql: sql.to_string(),
            params,
            resume_token: None,
        };

        match self.transport.call(request).await? {
            Response::ResultSet { metadata, rows } => {
                let columns = Arc::new(metadata.columns);
                Ok(rows
                    .into_iter()
                    .map(|values| Row::new(columns.clone(), values))
                    .collect())
            }
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to ExecuteSql: {:?}",
                other
            ))),
        }
    }

    /// Buffer an insert, applied atomically at commit.
    pub fn insert(&mut self, table: &str, row: serde_json::Value) {
        self.mutations.push(Mutation::Insert {
            table: table.to_string(),
            row,
        });
    }

    /// Buffer an update, applied atomically at commit.
    pub fn update(&mut self, table: &str, row: serde_json::Value) {
        self.mutations.push(Mutation::Update {
            table: table.to_string(),
            row,
        });
    }

    /// Buffer a delete, applied atomically at commit.
    pub fn delete(&mut self, table: &str, key: serde_json::Value) {
        self.mutations.push(Mutation::Delete {
            table: table.to_string(),
            key,
        });
    }

    /// Commit, returning the commit timestamp. The session returns to the
    /// pool whether or not the commit succeeds.
    pub async fn commit(mut self) -> ClientResult<i64> {
        let session_name = self.session_name()?;
        let request = Request::Commit {
            session: session_name,
            transaction: self.id.clone(),
            mutations: std::mem::take(&mut self.mutations),
        };
        let result = self.transport.call(request).await;
        self.finish();

        match result? {
            Response::Commit { commit_timestamp } => Ok(commit_timestamp),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to Commit: {:?}",
                other
            ))),
        }
    }

    /// Roll back and return the session to the pool. Buffered mutations
    /// are discarded.
    pub async fn rollback(mut self) -> ClientResult<()> {
        let session_name = self.session_name()?;
        let request = Request::Rollback {
            session: session_name,
            transaction: self.id.clone(),
        };
        let result = self.transport.call(request).await;
        self.finish();
        result.map(|_| ())
    }

    fn finish(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Abandoned without commit or rollback; the server expires the
        // transaction on its own, the session must not leak.
        self.finish();
    }
}

/// Retries transaction bodies until they commit.
pub struct TransactionRunner {
    transport: Arc<dyn Transport>,
    pool: Arc<SessionPool>,
    retry: RetryConfig,
}

impl TransactionRunner {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        pool: Arc<SessionPool>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            pool,
            retry,
        }
    }

    /// Run `body` inside a transaction, retrying the whole body on abort.
    ///
    /// The body must be safe to replay: it runs once per attempt, and only
    /// the final attempt's effects commit. Session acquisition failures
    /// and non-abort errors surface immediately; an error returned by the
    /// body rolls the attempt back first.
    pub async fn run<T, F>(&self, options: TransactionOptions, mut body: F) -> ClientResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, ClientResult<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let kind = if options.read_only {
                SessionKind::Read
            } else {
                SessionKind::ReadWrite
            };
            // Pool errors (exhaustion, closure) are not transient; they
            // are never retried.
            let session = self.pool.acquire(kind).await?;

            let mut txn = match Transaction::start(
                self.transport.clone(),
                self.pool.clone(),
                session,
                options.read_only,
            )
            .await
            {
                Ok(txn) => txn,
                Err(e) if e.is_aborted() => {
                    self.backoff_or_fail(attempt, started, options.timeout, e)
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match body(&mut txn).await {
                Ok(value) => {
                    if options.read_only {
                        // Snapshot reads have nothing to commit.
                        drop(txn);
                        return Ok(value);
                    }
                    match txn.commit().await {
                        Ok(_) => return Ok(value),
                        Err(e) if e.is_aborted() => {
                            self.backoff_or_fail(attempt, started, options.timeout, e)
                                .await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_aborted() => {
                    if let Err(rollback_err) = txn.rollback().await {
                        tracing::debug!(
                            "Rollback of aborted transaction failed: {}",
                            rollback_err
                        );
                    }
                    self.backoff_or_fail(attempt, started, options.timeout, e)
                        .await?;
                }
                Err(e) => {
                    if let Err(rollback_err) = txn.rollback().await {
                        tracing::warn!("Rollback failed: {}", rollback_err);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Sleep before the next attempt, or convert the abort into a final
    /// error when the retry budget or deadline is spent.
    async fn backoff_or_fail(
        &self,
        attempt: u32,
        started: Instant,
        timeout: Option<Duration>,
        cause: ClientError,
    ) -> ClientResult<()> {
        if let Some(max) = self.retry.max_attempts {
            if attempt >= max {
                return Err(cause);
            }
        }

        let delay = self.retry.backoff(attempt);
        if let Some(limit) = timeout {
            if started.elapsed() + delay >= limit {
                return Err(ClientError::DeadlineExceeded(format!(
                    "Transaction still aborting after {} attempt(s) over {:?}: {}",
                    attempt,
                    started.elapsed(),
                    cause
                )));
            }
        }

        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying aborted transaction"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPoolConfig;
    use crate::protocol::{Column, ResultSetMetadata, ValueKind};
    use crate::rpc::mock::MockTransport;
    use std::sync::atomic::Ordering;

    fn test_pool_config() -> SessionPoolConfig {
        SessionPoolConfig {
            min_sessions: 0,
            max_sessions: 4,
            write_fraction: 0.5,
            acquire_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(3600),
            keepalive_interval: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(3600),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    fn setup() -> (Arc<MockTransport>, Arc<SessionPool>, TransactionRunner) {
        let transport = Arc::new(MockTransport::new());
        let pool = SessionPool::open(
            transport.clone() as Arc<dyn Transport>,
            "projects/p/databases/d",
            test_pool_config(),
        );
        let runner =
            TransactionRunner::new(transport.clone(), pool.clone(), fast_retry());
        (transport, pool, runner)
    }

    #[tokio::test]
    async fn test_commit_on_first_attempt() {
        let (transport, pool, runner) = setup();

        let result = runner
            .run(TransactionOptions::default(), |txn| {
                txn.insert("users", serde_json::json!({ "id": 1, "name": "ada" }));
                Box::pin(async { Ok(()) })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(transport.commits.load(Ordering::SeqCst), 1);
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 1);
        assert_eq!(transport.last_mutations.lock().len(), 1);
        // The session went back to the pool.
        assert_eq!(pool.stats().checked_out, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_aborted_commit_is_retried_with_fresh_transaction() {
        let (transport, _pool, runner) = setup();
        transport.abort_next_commits.store(2, Ordering::SeqCst);

        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = attempts.clone();
        let result = runner
            .run(TransactionOptions::default(), move |_txn| {
                seen.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            })
            .await;

        assert!(result.is_ok());
        // The body ran once per attempt: two aborts, then success.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 3);
        assert_eq!(transport.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aborted_begin_is_retried() {
        let (transport, _pool, runner) = setup();
        transport.abort_next_begins.store(1, Ordering::SeqCst);

        let result = runner
            .run(TransactionOptions::default(), |_txn| {
                Box::pin(async { Ok(7) })
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 1);
        assert_eq!(transport.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_turns_persistent_abort_into_deadline_exceeded() {
        let (transport, _pool, runner) = setup();
        transport.abort_next_commits.store(usize::MAX, Ordering::SeqCst);

        let options = TransactionOptions {
            read_only: false,
            timeout: Some(Duration::from_millis(20)),
        };
        let err = runner
            .run::<(), _>(options, |_txn| Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::DeadlineExceeded(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_max_attempts_surfaces_the_abort() {
        let (transport, pool, _) = setup();
        transport.abort_next_commits.store(usize::MAX, Ordering::SeqCst);

        let retry = RetryConfig {
            max_attempts: Some(2),
            ..fast_retry()
        };
        let runner = TransactionRunner::new(transport.clone(), pool, retry);

        let err = runner
            .run::<(), _>(TransactionOptions::default(), |_txn| {
                Box::pin(async { Ok(()) })
            })
            .await
            .unwrap_err();

        assert!(err.is_aborted(), "{}", err);
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_body_error_rolls_back_and_is_not_retried() {
        let (transport, pool, runner) = setup();

        let err = runner
            .run::<(), _>(TransactionOptions::default(), |_txn| {
                Box::pin(async { Err(ClientError::Server("constraint violated".into())) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Server(_)));
        assert_eq!(transport.rolled_back.lock().len(), 1);
        assert_eq!(transport.commits.load(Ordering::SeqCst), 0);
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_read_only_skips_commit() {
        let (transport, pool, runner) = setup();
        *transport.unary_result.lock() = Some((
            ResultSetMetadata {
                columns: vec![Column {
                    name: "n".into(),
                    kind: ValueKind::Int,
                }],
            },
            vec![vec![Value::Int(3)]],
        ));

        let options = TransactionOptions {
            read_only: true,
            timeout: None,
        };
        let rows = runner
            .run(options, |txn| {
                Box::pin(async move { txn.run("SELECT n FROM t", HashMap::new()).await })
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&Value::Int(3)));
        assert_eq!(transport.commits.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_prepared_transaction_handle_is_consumed() {
        let transport = Arc::new(MockTransport::new());
        let pool = SessionPool::open(
            transport.clone() as Arc<dyn Transport>,
            "projects/p/databases/d",
            SessionPoolConfig {
                write_fraction: 1.0,
                ..test_pool_config()
            },
        );
        let runner =
            TransactionRunner::new(transport.clone(), pool.clone(), fast_retry());

        // Seed one idle session, then let maintenance prepare it.
        let session = pool.acquire(SessionKind::ReadWrite).await.unwrap();
        pool.release(session);
        pool.run_maintenance().await;
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 1);

        let result = runner
            .run(TransactionOptions::default(), |_txn| {
                Box::pin(async { Ok(()) })
            })
            .await;

        // The prepared handle was consumed, so no extra begin ran.
        assert!(result.is_ok());
        assert_eq!(transport.transactions_begun.load(Ordering::SeqCst), 1);
        assert_eq!(transport.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_returns_session() {
        let (transport, pool, _) = setup();

        let session = pool.acquire(SessionKind::ReadWrite).await.unwrap();
        let txn = Transaction::start(
            transport.clone() as Arc<dyn Transport>,
            pool.clone(),
            session,
            false,
        )
        .await
        .unwrap();

        assert_eq!(pool.stats().checked_out, 1);
        drop(txn);
        assert_eq!(pool.stats().checked_out, 0);
        assert_eq!(pool.stats().idle, 1);
    }
}
