//! The `Database` handle, entry point of the driver.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::TryStreamExt;

use crate::codec;
use crate::config::{RetryConfig, SessionPoolConfig};
use crate::error::ClientResult;
use crate::protocol::Request;
use crate::rpc::{TcpTransport, Transport};
use crate::session::{Session, SessionKind, SessionPool, SessionPoolStats};
use crate::stream::{partial_result_stream, Row, RowStream};
use crate::transaction::{Transaction, TransactionOptions, TransactionRunner};

/// Returns a checked-out session to its pool when the value it rides
/// along with (a row stream's factory) is dropped.
struct SessionGuard {
    pool: Arc<SessionPool>,
    session: Option<Session>,
}

impl SessionGuard {
    fn name(&self) -> String {
        self.session
            .as_ref()
            .map(|s| s.name().to_string())
            .unwrap_or_default()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

/// A handle to one StrataDB database.
///
/// Cheap to clone; all clones share the same transport and session pool.
///
/// ```no_run
/// use stratadb_client::Database;
///
/// # async fn demo() -> stratadb_client::ClientResult<()> {
/// let db = Database::connect("127.0.0.1:6745", "inventory").await?;
///
/// let rows = db
///     .run("SELECT sku, qty FROM stock WHERE qty < @low", serde_json::json!({ "low": 10 }))
///     .await?;
/// for row in rows {
///     println!("{:?}", row.into_json());
/// }
///
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
    transport: Arc<dyn Transport>,
    pool: Arc<SessionPool>,
    retry: RetryConfig,
}

impl Database {
    /// Connect with default pool and retry settings.
    pub async fn connect(addr: &str, database: &str) -> ClientResult<Self> {
        DatabaseBuilder::new(addr, database).connect().await
    }

    /// Start configuring a connection.
    pub fn builder(addr: &str, database: &str) -> DatabaseBuilder {
        DatabaseBuilder::new(addr, database)
    }

    pub(crate) fn from_parts(
        transport: Arc<dyn Transport>,
        database: impl Into<String>,
        pool_config: SessionPoolConfig,
        retry: RetryConfig,
    ) -> Self {
        let pool = SessionPool::open(transport.clone(), database, pool_config);
        Self {
            transport,
            pool,
            retry,
        }
    }

    /// Execute a SQL query outside any explicit transaction and collect
    /// the full result set.
    ///
    /// `params` is a JSON object mapping `@name` placeholders to values.
    pub async fn run(&self, sql: &str, params: serde_json::Value) -> ClientResult<Vec<Row>> {
        let stream = self.run_stream(sql, params).await?;
        stream.try_collect().await
    }

    /// Execute a SQL query and stream its rows.
    ///
    /// Rows arrive as the server produces them; transient stream breaks
    /// are resumed transparently. The session backing the query returns
    /// to the pool when the stream is dropped or fully consumed.
    pub async fn run_stream(
        &self,
        sql: &str,
        params: serde_json::Value,
    ) -> ClientResult<RowStream> {
        let params = codec::encode_params(params)?;
        let session = self.pool.acquire(SessionKind::Read).await?;
        let guard = SessionGuard {
            pool: self.pool.clone(),
            session: Some(session),
        };

        let transport = self.transport.clone();
        let session_name = guard.name();
        let sql = sql.to_string();

        // The guard lives inside the factory, so the session is released
        // exactly when the row stream goes away.
        let factory = move |resume_token: Option<Vec<u8>>| {
            let _ = &guard;
            let transport = transport.clone();
            let request = Request::ExecuteSql {
                session: session_name.clone(),
                transaction: None,
                sql: sql.clone(),
                params: params.clone(),
                resume_token,
            };
            Box::pin(async move { transport.open_stream(request).await })
                as BoxFuture<'static, ClientResult<crate::rpc::FrameStream>>
        };

        Ok(partial_result_stream(self.retry.clone(), factory))
    }

    /// Run `body` in a read-write transaction, retrying on abort until it
    /// commits. See [`TransactionRunner::run`] for replay requirements.
    pub async fn run_transaction<T, F>(&self, body: F) -> ClientResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, ClientResult<T>>,
    {
        self.run_transaction_with_options(TransactionOptions::default(), body)
            .await
    }

    pub async fn run_transaction_with_options<T, F>(
        &self,
        options: TransactionOptions,
        body: F,
    ) -> ClientResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, ClientResult<T>>,
    {
        TransactionRunner::new(self.transport.clone(), self.pool.clone(), self.retry.clone())
            .run(options, body)
            .await
    }

    /// Begin a transaction under manual control. The caller owns commit
    /// and rollback; aborts are not retried.
    pub async fn transaction(&self) -> ClientResult<Transaction> {
        let session = self.pool.acquire(SessionKind::ReadWrite).await?;
        Transaction::start(self.transport.clone(), self.pool.clone(), session, false).await
    }

    /// Begin a manual read-only snapshot transaction.
    pub async fn read_only_transaction(&self) -> ClientResult<Transaction> {
        let session = self.pool.acquire(SessionKind::Read).await?;
        Transaction::start(self.transport.clone(), self.pool.clone(), session, true).await
    }

    /// Round-trip liveness check, outside any session.
    pub async fn ping(&self) -> ClientResult<()> {
        self.transport
            .call(Request::Ping { session: None })
            .await
            .map(|_| ())
    }

    pub fn pool_stats(&self) -> SessionPoolStats {
        self.pool.stats()
    }

    /// Shut down: fail queued acquisitions, stop maintenance, and delete
    /// idle sessions. Reports still-checked-out sessions as leaks.
    pub async fn close(&self) -> ClientResult<()> {
        self.pool.close().await
    }
}

/// Builder for [`Database`] connections.
pub struct DatabaseBuilder {
    addr: String,
    database: String,
    connections: Option<usize>,
    pool_config: SessionPoolConfig,
    retry: RetryConfig,
}

impl DatabaseBuilder {
    pub fn new(addr: &str, database: &str) -> Self {
        Self {
            addr: addr.to_string(),
            database: database.to_string(),
            connections: None,
            pool_config: SessionPoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Number of multiplexed TCP connections for unary calls.
    pub fn connections(mut self, count: usize) -> Self {
        self.connections = Some(count);
        self
    }

    pub fn pool_config(mut self, config: SessionPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn connect(self) -> ClientResult<Database> {
        let transport = match self.connections {
            Some(count) => TcpTransport::connect_with_connections(&self.addr, count).await?,
            None => TcpTransport::connect(&self.addr).await?,
        };
        Ok(Database::from_parts(
            Arc::new(transport),
            self.database,
            self.pool_config,
            self.retry,
        ))
    }
}
