//! Streaming result reconstruction.
//!
//! A streaming query arrives as a sequence of [`PartialResultFrame`]s
//! whose flat value lists span row boundaries, and whose trailing value
//! may be cut mid-content and continued in the next frame. This module
//! reassembles those frames into complete [`Row`]s and transparently
//! resumes the underlying call after a retryable break.
//!
//! Completed rows are held until the next resume token (or clean end of
//! stream) before being emitted. The server replays everything after the
//! last token on resume, so emitting earlier would hand the consumer
//! duplicate rows after a break.

use std::sync::Arc;

use async_stream::try_stream;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};

use crate::codec;
use crate::config::RetryConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{Column, PartialResultFrame, Value};
use crate::rpc::FrameStream;

/// One row of a result set: ordered (column, value) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<Column>>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<Vec<Column>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the named column, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map(|i| &self.values[i])
    }

    /// Convert into a plain key/value mapping.
    pub fn into_json(self) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .zip(self.values)
            .map(|(c, v)| (c.name.clone(), codec::value_to_json(v)))
            .collect()
    }
}

/// Lazy, forward-only sequence of rows. Once consumed or terminated by an
/// error it cannot be replayed; issue a new query for a fresh read.
pub type RowStream = std::pin::Pin<Box<dyn Stream<Item = ClientResult<Row>> + Send>>;

/// Two chunk halves merge only when their kinds match and the kind is
/// chunkable. Numbers, bools and nulls are never cut mid-value, so a
/// split next to one is an ordinary element boundary.
fn is_mergeable_pair(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Str(_), Value::Str(_))
            | (Value::Bytes(_), Value::Bytes(_))
            | (Value::List(_), Value::List(_))
            | (Value::Struct(_), Value::Struct(_))
    )
}

/// Merge the tail of one frame's last value with the head of the next
/// frame's first value.
pub(crate) fn merge_values(prev: Value, next: Value) -> ClientResult<Value> {
    match (prev, next) {
        (Value::Str(mut a), Value::Str(b)) => {
            a.push_str(&b);
            Ok(Value::Str(a))
        }
        (Value::Bytes(mut a), Value::Bytes(b)) => {
            a.extend_from_slice(&b);
            Ok(Value::Bytes(a))
        }
        (Value::List(a), Value::List(b)) => Ok(Value::List(merge_elements(a, b)?)),
        (Value::Struct(a), Value::Struct(b)) => Ok(Value::Struct(merge_elements(a, b)?)),
        (a, b) => Err(ClientError::Protocol(format!(
            "Cannot merge chunked {:?} with {:?}",
            a.kind(),
            b.kind()
        ))),
    }
}

/// List/struct rule: the boundary elements merge recursively when their
/// kinds allow it and splice side by side otherwise; the remaining
/// elements concatenate around them.
fn merge_elements(mut a: Vec<Value>, mut b: Vec<Value>) -> ClientResult<Vec<Value>> {
    if a.is_empty() {
        return Ok(b);
    }
    if b.is_empty() {
        return Ok(a);
    }

    let last = match a.pop() {
        Some(v) => v,
        None => return Ok(b),
    };
    let first = b.remove(0);

    if is_mergeable_pair(&last, &first) {
        a.push(merge_values(last, first)?);
    } else {
        a.push(last);
        a.push(first);
    }
    a.extend(b);
    Ok(a)
}

/// Reassemble a streaming call into rows.
///
/// `factory` opens the call, taking the resume token to restart from
/// (`None` for the first attempt). On a retryable break the call is
/// reopened from the last recorded token and all state accumulated since
/// that token is discarded; the consumer observes neither the error nor
/// any duplicated or missing rows. Consecutive breaks back off per
/// `retry`, and once `retry.max_attempts` breaks pass without a single
/// frame arriving, the last break is surfaced. Non-retryable failures
/// terminate the sequence.
pub(crate) fn partial_result_stream<F>(retry: RetryConfig, mut factory: F) -> RowStream
where
    F: FnMut(Option<Vec<u8>>) -> BoxFuture<'static, ClientResult<FrameStream>> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut resume_token: Option<Vec<u8>> = None;
        let mut columns: Option<Arc<Vec<Column>>> = None;
        // At most one partially-received value awaiting its continuation.
        let mut pending: Option<Value> = None;
        // Completed values not yet grouped into a full row.
        let mut assembled: Vec<Value> = Vec::new();
        // Complete rows held back until the next resume token.
        let mut ready: Vec<Row> = Vec::new();
        // Consecutive breaks without progress; reset on every frame.
        let mut breaks: u32 = 0;

        'attempt: loop {
            let mut frames = match factory(resume_token.clone()).await {
                Ok(frames) => frames,
                Err(e) if e.is_retryable_stream_break() => {
                    breaks += 1;
                    if retry.max_attempts.is_some_and(|max| breaks >= max) {
                        Err(e.clone())?;
                    }
                    let delay = retry.backoff(breaks);
                    tracing::debug!(
                        breaks,
                        delay_ms = delay.as_millis() as u64,
                        "Reopening result stream after break: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    pending = None;
                    assembled.clear();
                    ready.clear();
                    continue 'attempt;
                }
                Err(e) => {
                    Err(e)?;
                    continue 'attempt;
                }
            };

            loop {
                match frames.next().await {
                    None => {
                        if pending.is_some() || !assembled.is_empty() {
                            Err(ClientError::Protocol(
                                "Stream ended with an unfinished row".to_string(),
                            ))?;
                        }
                        for row in ready.drain(..) {
                            yield row;
                        }
                        break 'attempt;
                    }
                    Some(Err(e)) if e.is_retryable_stream_break() => {
                        breaks += 1;
                        if retry.max_attempts.is_some_and(|max| breaks >= max) {
                            Err(e.clone())?;
                        }
                        let delay = retry.backoff(breaks);
                        tracing::debug!(
                            breaks,
                            delay_ms = delay.as_millis() as u64,
                            "Resuming result stream after break: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                        pending = None;
                        assembled.clear();
                        ready.clear();
                        continue 'attempt;
                    }
                    Some(Err(e)) => {
                        Err(e)?;
                    }
                    Some(Ok(frame)) => {
                        breaks = 0;
                        let PartialResultFrame {
                            metadata,
                            mut values,
                            chunked_value,
                            resume_token: token,
                        } = frame;

                        let cols = match &columns {
                            Some(cols) => cols.clone(),
                            None => {
                                let metadata = metadata.ok_or_else(|| {
                                    ClientError::Protocol(
                                        "First frame carried no metadata".to_string(),
                                    )
                                })?;
                                if metadata.columns.is_empty() {
                                    Err(ClientError::Protocol(
                                        "Result metadata has no columns".to_string(),
                                    ))?;
                                }
                                let cols = Arc::new(metadata.columns);
                                columns = Some(cols.clone());
                                cols
                            }
                        };

                        if let Some(partial) = pending.take() {
                            if values.is_empty() {
                                // Token-only frame; the partial stays pending.
                                pending = Some(partial);
                            } else {
                                let first = values.remove(0);
                                values.insert(0, merge_values(partial, first)?);
                            }
                        }

                        if chunked_value {
                            match values.pop() {
                                Some(v) => pending = Some(v),
                                None => {
                                    if pending.is_none() {
                                        Err(ClientError::Protocol(
                                            "Chunked frame carried no values".to_string(),
                                        ))?;
                                    }
                                }
                            }
                        }

                        assembled.append(&mut values);
                        while assembled.len() >= cols.len() {
                            let row_values: Vec<Value> =
                                assembled.drain(..cols.len()).collect();
                            ready.push(Row::new(cols.clone(), row_values));
                        }

                        // A token acknowledges everything before it, so the
                        // held rows may finally flow downstream. A token on
                        // a frame that left a value pending would land
                        // mid-value and is ignored.
                        if pending.is_none() && assembled.is_empty() {
                            if let Some(token) = token {
                                resume_token = Some(token);
                                for row in ready.drain(..) {
                                    yield row;
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}
