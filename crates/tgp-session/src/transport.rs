//! Message links between two gateways.
//!
//! [`TcpLink`] carries length-prefixed JSON frames over TCP; [`MemoryLink`]
//! connects two in-process endpoints through channels. Both implement
//! [`PeerLink`], whose `recv` is cancel-safe so it can sit in a
//! `tokio::select!`.

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use tgp_core::codec;
use tgp_core::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::{Backoff, SessionConfig};
use crate::error::SessionError;

#[async_trait]
pub trait PeerLink: Send {
    async fn send(&mut self, msg: &Message) -> Result<(), SessionError>;

    /// Next message, or `None` once the remote side closed cleanly.
    async fn recv(&mut self) -> Result<Option<Message>, SessionError>;

    /// Human-readable remote address for logs.
    fn remote(&self) -> String;
}

pub struct TcpLink {
    stream: TcpStream,
    read_buf: BytesMut,
    remote: String,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Self {
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            remote,
        }
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Transport(format!("connect {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        let mut frame = BytesMut::new();
        codec::encode_frame(msg, &mut frame)?;
        self.stream.write_all(&frame).await?;
        tracing::trace!(remote = %self.remote, kind = msg.kind(), bytes = frame.len(), "frame sent");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>, SessionError> {
        loop {
            if let Some(msg) = codec::decode_frame(&mut self.read_buf)? {
                return Ok(Some(msg));
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::Transport(format!(
                    "connection closed mid-frame ({} bytes buffered)",
                    self.read_buf.len()
                )));
            }
        }
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }
}

/// Dial `addr`, retrying with bounded exponential backoff.
pub async fn connect_with_backoff(
    addr: SocketAddr,
    config: &SessionConfig,
) -> Result<TcpLink, SessionError> {
    let mut backoff = Backoff::new(config);
    loop {
        match TcpLink::connect(addr).await {
            Ok(link) => return Ok(link),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(%addr, error = %e, retry_in_ms = delay.as_millis() as u64, "connect failed");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(SessionError::ReconnectExhausted {
                        attempts: backoff.attempts(),
                    })
                }
            },
        }
    }
}

/// In-process link. Messages still pass through the codec so both ends see
/// exactly what a TCP peer would.
pub struct MemoryLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    name: String,
}

impl MemoryLink {
    /// Two connected endpoints.
    pub fn pair(capacity: usize) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            MemoryLink {
                tx: a_tx,
                rx: a_rx,
                name: "memory:a".into(),
            },
            MemoryLink {
                tx: b_tx,
                rx: b_rx,
                name: "memory:b".into(),
            },
        )
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        let body = codec::encode(msg)?;
        self.tx.send(body).await.map_err(|_| SessionError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Message>, SessionError> {
        match self.rx.recv().await {
            Some(body) => Ok(Some(codec::decode(&body)?)),
            None => Ok(None),
        }
    }

    fn remote(&self) -> String {
        self.name.clone()
    }
}
