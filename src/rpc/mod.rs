//! RPC transport seam.
//!
//! The driver core (pool, transaction runner, row stream) talks to the
//! server exclusively through the [`Transport`] trait: one unary call and
//! one server-streaming call. The default implementation is
//! [`TcpTransport`]; tests substitute a scripted in-memory transport.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ClientResult;
use crate::protocol::{PartialResultFrame, Request, Response};

mod tcp;
pub use tcp::TcpTransport;

#[cfg(test)]
pub(crate) mod mock;

/// A server-streaming call: a sequence of partial result frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = ClientResult<PartialResultFrame>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a unary call and await its single response.
    ///
    /// Server-reported errors are already mapped to `ClientError` so the
    /// caller can classify them (`is_aborted`, `is_retryable_stream_break`).
    async fn call(&self, request: Request) -> ClientResult<Response>;

    /// Open a server-streaming call. Dropping the returned stream closes
    /// the underlying call.
    async fn open_stream(&self, request: Request) -> ClientResult<FrameStream>;
}
