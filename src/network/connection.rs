//! Connection handling for relay sockets
//!
//! Each accepted socket is split in two:
//! - the read half stays with the server's reader task, which owns the frame decoder
//! - the write half moves into `write_loop`, fed through a `ConnectionHandle`

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};

use super::pool::Pooled;

/// Outbound commands queued per connection
pub const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Work for a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    /// Encoded reply frame; the buffer goes back to its pool once written
    Reply(Pooled<BytesMut>),
    /// Bytes written as-is
    Raw(Bytes),
    /// Liveness check answered through the channel
    Probe(oneshot::Sender<bool>),
    /// Stop writing and shut the socket down
    Close,
}

/// Connection statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames received
    pub frames_received: u64,
    /// Replies and raw writes sent
    pub messages_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    frames_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A handle for sending to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    sender: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
    closed: Arc<watch::Sender<bool>>,
    stats: Arc<StatCounters>,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, sender: mpsc::Sender<Outbound>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(closed),
            stats: Arc::new(StatCounters::default()),
        }
    }

    /// Unique id of the underlying connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether both handles refer to the same connection
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.id == other.id
    }

    /// Queue an encoded reply
    pub async fn send_reply(&self, reply: Pooled<BytesMut>) -> ConnectionResult<()> {
        self.send(Outbound::Reply(reply)).await
    }

    /// Queue raw bytes
    pub async fn send_raw(&self, bytes: Bytes) -> ConnectionResult<()> {
        self.send(Outbound::Raw(bytes)).await
    }

    async fn send(&self, outbound: Outbound) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(outbound)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Ask the writer to touch the socket. False when the connection is gone
    /// or the writer does not answer in time.
    pub async fn probe(&self, wait: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        let answered = tokio::time::timeout(wait, async {
            self.sender.send(Outbound::Probe(tx)).await.ok()?;
            rx.await.ok()
        })
        .await;

        matches!(answered, Ok(Some(true))) && self.is_connected()
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected and wake its reader and writer
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closed.send_replace(true);
            let _ = self.sender.try_send(Outbound::Close);
        }
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.stats
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_sent(&self, bytes: usize) {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Drain outbound commands into the socket until closed
pub(crate) async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    handle: ConnectionHandle,
    send_timeout: Duration,
) -> ConnectionResult<()> {
    let result = loop {
        let next = tokio::select! {
            next = outbound.recv() => next,
            _ = handle.closed() => None,
        };

        let written = match next {
            Some(Outbound::Reply(buf)) => write_timed(&mut writer, &buf, send_timeout).await,
            Some(Outbound::Raw(bytes)) => write_timed(&mut writer, &bytes, send_timeout).await,
            Some(Outbound::Probe(ack)) => {
                let alive = tokio::time::timeout(send_timeout, writer.write(&[]))
                    .await
                    .map_or(false, |r| r.is_ok());
                let _ = ack.send(alive);
                if alive {
                    continue;
                }
                Err(ConnectionError::Closed)
            }
            Some(Outbound::Close) | None => break Ok(()),
        };

        match written {
            Ok(n) => handle.record_sent(n),
            Err(e) => break Err(e),
        }
    };

    handle.close();
    let _ = writer.shutdown().await;
    result
}

async fn write_timed(
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
    send_timeout: Duration,
) -> ConnectionResult<usize> {
    let write = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    match tokio::time::timeout(send_timeout, write).await {
        Ok(result) => result.map(|_| bytes.len()).map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::Timeout),
    }
}
