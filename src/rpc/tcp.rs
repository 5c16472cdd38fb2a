//! TCP transport over the StrataDB native wire protocol.

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    decode_message, encode_message, Request, Response, StreamMessage, MAX_MESSAGE_SIZE,
    STRATA_MAGIC,
};
use crate::rpc::{FrameStream, Transport};

const DEFAULT_CONNECTIONS: usize = 4;

struct Connection {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            ClientError::Connection(format!("Failed to connect to {}: {}", addr, e))
        })?;

        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let (read, mut write) = stream.into_split();

        write
            .write_all(STRATA_MAGIC)
            .await
            .map_err(|e| ClientError::Connection(format!("Failed to send magic header: {}", e)))?;

        Ok(Self { read, write })
    }

    async fn send(&mut self, request: &Request) -> ClientResult<()> {
        let data = encode_message(request)?;
        self.write
            .write_all(&data)
            .await
            .map_err(|e| ClientError::Connection(format!("Write failed: {}", e)))?;
        self.write
            .flush()
            .await
            .map_err(|e| ClientError::Connection(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    async fn recv<T: for<'de> serde::Deserialize<'de>>(&mut self) -> ClientResult<T> {
        let mut len_buf = [0u8; 4];
        self.read
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| ClientError::Connection(format!("Read length failed: {}", e)))?;

        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(ClientError::MessageTooLarge);
        }

        let mut payload = vec![0u8; msg_len];
        self.read
            .read_exact(&mut payload)
            .await
            .map_err(|e| ClientError::Connection(format!("Read payload failed: {}", e)))?;

        decode_message(&payload)
    }
}

/// Default transport: a small fixed set of multiplexed connections served
/// round-robin for unary calls, plus a dedicated connection per streaming
/// call so slow consumers never stall unary traffic.
pub struct TcpTransport {
    addr: String,
    pool: Vec<Mutex<Connection>>,
    next_index: std::sync::atomic::AtomicUsize,
}

impl TcpTransport {
    /// Connect with the default number of multiplexed connections.
    pub async fn connect(addr: &str) -> ClientResult<Self> {
        Self::connect_with_connections(addr, DEFAULT_CONNECTIONS).await
    }

    pub async fn connect_with_connections(addr: &str, count: usize) -> ClientResult<Self> {
        let mut pool = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            pool.push(Mutex::new(Connection::open(addr).await?));
        }

        Ok(Self {
            addr: addr.to_string(),
            pool,
            next_index: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn next_connection(&self) -> &Mutex<Connection> {
        let idx = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.pool.len();
        &self.pool[idx]
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, request: Request) -> ClientResult<Response> {
        let mut conn = self.next_connection().lock().await;
        conn.send(&request).await?;
        let response: Response = conn.recv().await?;

        match response {
            Response::Error { error } => Err(error.into()),
            other => Ok(other),
        }
    }

    async fn open_stream(&self, request: Request) -> ClientResult<FrameStream> {
        let mut conn = Connection::open(&self.addr).await?;
        conn.send(&request).await?;

        Ok(Box::pin(try_stream! {
            loop {
                // A connection lost mid-stream is resumable from the last
                // token; reclassify so the row stream reopens the call.
                let msg: StreamMessage = match conn.recv().await {
                    Ok(msg) => msg,
                    Err(ClientError::Connection(e)) => {
                        Err(ClientError::StreamBroken(e))?;
                        break;
                    }
                    Err(e) => {
                        Err(e)?;
                        break;
                    }
                };
                match msg {
                    StreamMessage::Frame { frame } => yield frame,
                    StreamMessage::End => break,
                    StreamMessage::Error { error } => Err(ClientError::from(error))?,
                }
            }
        }))
    }
}
