//! StrataDB Rust client driver.
//!
//! StrataDB is a distributed, strongly consistent relational database.
//! This crate manages everything between an application and the servers:
//! a bounded pool of server-side sessions, a retry loop for aborted
//! read-write transactions, and reassembly of streamed partial results
//! into rows.
//!
//! # Quick start
//!
//! ```no_run
//! use stratadb_client::Database;
//!
//! # async fn demo() -> stratadb_client::ClientResult<()> {
//! let db = Database::connect("127.0.0.1:6745", "inventory").await?;
//!
//! // One-shot query, outside any explicit transaction.
//! let rows = db.run("SELECT sku FROM stock", serde_json::json!(null)).await?;
//!
//! // Read-write transaction, replayed automatically on abort.
//! db.run_transaction(|txn| {
//!     Box::pin(async move {
//!         let rows = txn
//!             .run("SELECT qty FROM stock WHERE sku = @sku", Default::default())
//!             .await?;
//!         txn.update("stock", serde_json::json!({ "sku": "a-1", "qty": 5 }));
//!         Ok(rows.len())
//!     })
//! })
//! .await?;
//!
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod stream;
pub mod transaction;

pub use client::{Database, DatabaseBuilder};
pub use config::{RetryConfig, SessionPoolConfig};
pub use error::{ClientError, ClientResult, LeakedSession};
pub use protocol::{Column, Mutation, Value, ValueKind};
pub use session::{SessionKind, SessionPool, SessionPoolStats};
pub use stream::{Row, RowStream};
pub use transaction::{Transaction, TransactionOptions, TransactionRunner};
