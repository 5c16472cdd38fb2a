//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    Mutation, PartialResultFrame, Request, Response, ResultSetMetadata, Value,
};
use crate::rpc::{FrameStream, Transport};

#[derive(Default)]
pub(crate) struct MockTransport {
    next_session: AtomicUsize,
    next_transaction: AtomicUsize,

    /// Make the next N CreateSession calls fail.
    pub fail_next_creates: AtomicUsize,
    /// Artificial latency applied to every CreateSession call.
    pub create_delay: Mutex<Option<std::time::Duration>>,
    /// Make the next N Commit calls fail with `Aborted`.
    pub abort_next_commits: AtomicUsize,
    /// Make the next N BeginTransaction calls fail with `Aborted`.
    pub abort_next_begins: AtomicUsize,

    pub sessions_created: AtomicUsize,
    pub transactions_begun: AtomicUsize,
    pub commits: AtomicUsize,
    pub deleted: Mutex<Vec<String>>,
    pub pinged: Mutex<Vec<String>>,
    pub rolled_back: Mutex<Vec<String>>,
    pub last_mutations: Mutex<Vec<Mutation>>,

    /// Canned reply for unary ExecuteSql.
    pub unary_result: Mutex<Option<(ResultSetMetadata, Vec<Vec<Value>>)>>,

    /// One entry per expected `open_stream` call, consumed in order.
    pub stream_script: Mutex<VecDeque<Vec<ClientResult<PartialResultFrame>>>>,
    /// Resume tokens observed by `open_stream`, in call order.
    pub stream_tokens_seen: Mutex<Vec<Option<Vec<u8>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_budget(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn push_stream_attempt(&self, frames: Vec<ClientResult<PartialResultFrame>>) {
        self.stream_script.lock().push_back(frames);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, request: Request) -> ClientResult<Response> {
        match request {
            Request::Ping { session } => {
                if let Some(name) = session {
                    self.pinged.lock().push(name);
                }
                Ok(Response::Pong { timestamp: 0 })
            }
            Request::CreateSession { .. } => {
                let delay = *self.create_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if Self::take_budget(&self.fail_next_creates) {
                    return Err(ClientError::Server("session create failed".into()));
                }
                let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
                self.sessions_created.fetch_add(1, Ordering::SeqCst);
                Ok(Response::Session {
                    name: format!("s-{}", n),
                })
            }
            Request::DeleteSession { session } => {
                self.deleted.lock().push(session);
                Ok(Response::Ok)
            }
            Request::BeginTransaction { .. } => {
                if Self::take_budget(&self.abort_next_begins) {
                    return Err(ClientError::Aborted("begin aborted".into()));
                }
                let n = self.next_transaction.fetch_add(1, Ordering::SeqCst) + 1;
                self.transactions_begun.fetch_add(1, Ordering::SeqCst);
                Ok(Response::Transaction {
                    id: format!("tx-{}", n),
                })
            }
            Request::Commit { mutations, .. } => {
                if Self::take_budget(&self.abort_next_commits) {
                    return Err(ClientError::Aborted("commit conflict".into()));
                }
                *self.last_mutations.lock() = mutations;
                self.commits.fetch_add(1, Ordering::SeqCst);
                Ok(Response::Commit {
                    commit_timestamp: 42,
                })
            }
            Request::Rollback { transaction, .. } => {
                self.rolled_back.lock().push(transaction);
                Ok(Response::Ok)
            }
            Request::ExecuteSql { .. } => {
                let (metadata, rows) = self
                    .unary_result
                    .lock()
                    .clone()
                    .unwrap_or((ResultSetMetadata { columns: vec![] }, vec![]));
                Ok(Response::ResultSet { metadata, rows })
            }
        }
    }

    async fn open_stream(&self, request: Request) -> ClientResult<FrameStream> {
        let resume_token = match request {
            Request::ExecuteSql { resume_token, .. } => resume_token,
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected streaming request: {:?}",
                    other
                )))
            }
        };
        self.stream_tokens_seen.lock().push(resume_token);

        let frames = self
            .stream_script
            .lock()
            .pop_front()
            .ok_or_else(|| ClientError::Protocol("no scripted stream attempt left".into()))?;

        Ok(Box::pin(futures::stream::iter(frames)))
    }
}
