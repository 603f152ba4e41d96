//! Relay socket client
//!
//! Sends frames to a relay server. Sync requests carry a non-zero sequence id
//! and a reader task hands each reply to the request waiting for it.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::protocol::{
    encode_reply_channel_request, CodecError, CodecResult, Encoder, Frame, Reply, ReplyDecoder,
    REPLY_CHANNEL_COMMAND,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed before a reply arrived")]
    Closed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Requests are still in flight")]
    Busy,
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// The equivalent I/O error, for callers that classify transport failures
    pub fn to_io_error(&self) -> io::Error {
        let kind = match self {
            ClientError::Io(e) => e.kind(),
            ClientError::Codec(_) => io::ErrorKind::InvalidData,
            ClientError::NotConnected => io::ErrorKind::NotConnected,
            ClientError::Closed => io::ErrorKind::ConnectionReset,
            ClientError::Timeout => io::ErrorKind::TimedOut,
            ClientError::Busy => io::ErrorKind::WouldBlock,
        };
        io::Error::new(kind, self.to_string())
    }
}

#[derive(Default)]
struct ClientShared {
    pending: Mutex<HashMap<i16, oneshot::Sender<Reply>>>,
    /// Timed-out requests whose reply may still arrive
    abandoned: Mutex<HashSet<i16>>,
    /// Waiting for a single unframed answer byte
    raw_waiter: Mutex<Option<oneshot::Sender<u8>>>,
    connected: AtomicBool,
}

impl ClientShared {
    /// Route everything decodable in `buf`
    fn drain(&self, buf: &mut BytesMut, decoder: &mut ReplyDecoder) -> CodecResult<()> {
        while !buf.is_empty() {
            let waiter = self.raw_waiter.lock().take();
            if let Some(waiter) = waiter {
                let answer = buf.split_to(1)[0];
                let _ = waiter.send(answer);
                continue;
            }

            let Some(reply) = decoder.decode(buf, true)? else {
                break;
            };
            let waiting = self.pending.lock().remove(&reply.sequence);
            match waiting {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None if self.abandoned.lock().remove(&reply.sequence) => {
                    tracing::debug!("Dropping late reply for sequence {}", reply.sequence);
                }
                None => tracing::debug!("Dropping reply for unknown sequence {}", reply.sequence),
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter
        self.pending.lock().clear();
        self.abandoned.lock().clear();
        self.raw_waiter.lock().take();
    }
}

/// Relay socket client
pub struct SocketClient {
    /// Client configuration
    config: ClientConfig,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    encoder: Encoder,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<ClientShared>,
    next_sequence: AtomicU16,
    reader_task: JoinHandle<()>,
}

impl SocketClient {
    /// Connect to a server by address
    pub async fn connect(server_addr: SocketAddr, config: ClientConfig) -> ClientResult<Self> {
        tracing::debug!("Connecting to {}", server_addr);

        // Connect with timeout
        let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(server_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;

        let (reader, writer) = stream.into_split();
        let shared = Arc::new(ClientShared {
            connected: AtomicBool::new(true),
            ..Default::default()
        });
        let decoder = ReplyDecoder::new(config.byte_order(), config.maximum_reply_message_size);
        let reader_task = tokio::spawn(read_replies(reader, shared.clone(), decoder, server_addr));

        tracing::info!("Connected to relay server {}", server_addr);

        Ok(Self {
            encoder: Encoder::new(config.byte_order()),
            config,
            server_addr,
            local_addr,
            writer: tokio::sync::Mutex::new(writer),
            shared,
            next_sequence: AtomicU16::new(1),
            reader_task,
        })
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(hostname: &str, port: u16, config: ClientConfig) -> ClientResult<Self> {
        let addr = super::resolve_host(hostname, port).await?;
        Self::connect(addr, config).await
    }

    /// Send a frame without waiting for anything back
    pub async fn send_oneway(&self, command_id: i16, payload: Bytes) -> ClientResult<()> {
        self.write_frame(Frame::new(0, command_id, false, payload)).await
    }

    /// Send a frame and wait for its reply. `None` when the server had no reply payload.
    pub async fn send_sync(&self, command_id: i16, payload: Bytes) -> ClientResult<Option<Bytes>> {
        let sequence = self.allocate_sequence();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(sequence, tx);

        if let Err(e) = self.write_frame(Frame::new(sequence, command_id, true, payload)).await {
            self.shared.pending.lock().remove(&sequence);
            return Err(e);
        }

        match tokio::time::timeout(self.config.receive_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                if self.shared.pending.lock().remove(&sequence).is_some() {
                    self.shared.abandoned.lock().insert(sequence);
                }
                Err(ClientError::Timeout)
            }
        }
    }

    /// Ask the server to send replies for `endpoint` over this connection.
    /// Only valid while no sync requests are in flight and no timed-out
    /// request can still be answered.
    pub async fn register_reply_channel(&self, endpoint: SocketAddrV4) -> ClientResult<bool> {
        if !self.shared.pending.lock().is_empty() || !self.shared.abandoned.lock().is_empty() {
            return Err(ClientError::Busy);
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.raw_waiter.lock() = Some(tx);

        let payload = encode_reply_channel_request(endpoint, self.config.byte_order());
        if let Err(e) = self
            .write_frame(Frame::new(0, REPLY_CHANNEL_COMMAND, true, payload))
            .await
        {
            self.shared.raw_waiter.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(self.config.receive_timeout(), rx).await {
            Ok(Ok(answer)) => Ok(answer == 1),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.raw_waiter.lock().take();
                Err(ClientError::Timeout)
            }
        }
    }

    async fn write_frame(&self, frame: Frame) -> ClientResult<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let mut buf = BytesMut::new();
        self.encoder.encode(&frame, &mut buf)?;

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.config.send_timeout(), write).await {
            Ok(result) => result.map_err(|e| {
                self.shared.disconnect();
                ClientError::Io(e)
            }),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    fn allocate_sequence(&self) -> i16 {
        loop {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) as i16;
            if sequence != 0 {
                return sequence;
            }
        }
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Disconnect from the server
    pub async fn close(&self) {
        self.shared.disconnect();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_replies(
    mut reader: OwnedReadHalf,
    shared: Arc<ClientShared>,
    mut decoder: ReplyDecoder,
    server_addr: SocketAddr,
) {
    let mut buf = BytesMut::with_capacity(8192);
    let reason = loop {
        if let Err(e) = shared.drain(&mut buf, &mut decoder) {
            tracing::warn!("Bad reply from {}: {}", server_addr, e);
            break e.to_string();
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => break "Connection closed".to_string(),
            Ok(_) => {}
            Err(e) => break format!("Error: {}", e),
        }
    };

    shared.disconnect();
    tracing::debug!("Disconnected from {}: {}", server_addr, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::{HandlerResult, MessageHandler, SocketServer};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle_message(
            &self,
            command_id: i16,
            payload: &[u8],
            _peer: SocketAddr,
        ) -> HandlerResult<Option<Bytes>> {
            match command_id {
                1 => Ok(Some(Bytes::copy_from_slice(payload))),
                2 => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(None)
                }
                _ => Ok(None),
            }
        }
    }

    async fn start_server() -> (SocketServer, SocketAddr) {
        let config = ServerConfig {
            port: 0,
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            connection_check_interval_secs: 0,
            sync_threads: 4,
            oneway_threads: 1,
            ..Default::default()
        };
        let mut server = SocketServer::new(config, Arc::new(EchoHandler));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            receive_timeout_ms: 2000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sync_roundtrip() {
        let (_server, addr) = start_server().await;
        let client = SocketClient::connect(addr, client_config()).await.unwrap();
        assert!(client.is_connected());

        let reply = client.send_sync(1, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello"[..]));

        // Empty reply sentinel maps to None
        assert_eq!(client.send_sync(99, Bytes::new()).await.unwrap(), None);
        client.send_oneway(1, Bytes::from_static(b"fire")).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let (_server, addr) = start_server().await;
        let client = Arc::new(SocketClient::connect(addr, client_config()).await.unwrap());

        let tasks: Vec<_> = (0..16u8)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let reply = client.send_sync(1, Bytes::from(vec![i; 4])).await.unwrap();
                    assert_eq!(reply.unwrap(), Bytes::from(vec![i; 4]));
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (_server, addr) = start_server().await;
        let config = ClientConfig {
            receive_timeout_ms: 50,
            ..Default::default()
        };
        let client = SocketClient::connect(addr, config).await.unwrap();
        assert!(matches!(
            client.send_sync(2, Bytes::new()).await,
            Err(ClientError::Timeout)
        ));
        assert!(client.shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_register_reply_channel() {
        let (_server, addr) = start_server().await;
        let client = SocketClient::connect(addr, client_config()).await.unwrap();
        let endpoint = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 45000);
        assert!(client.register_reply_channel(endpoint).await.unwrap());

        // Framed traffic still works afterwards
        let reply = client.send_sync(1, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn test_reply_channel_waits_for_late_replies() {
        let (_server, addr) = start_server().await;
        let config = ClientConfig {
            receive_timeout_ms: 50,
            ..Default::default()
        };
        let client = SocketClient::connect(addr, config).await.unwrap();
        assert!(matches!(
            client.send_sync(2, Bytes::new()).await,
            Err(ClientError::Timeout)
        ));

        let endpoint = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 45001);
        assert!(matches!(
            client.register_reply_channel(endpoint).await,
            Err(ClientError::Busy)
        ));

        // The late empty reply clears the way
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.shared.abandoned.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(client.register_reply_channel(endpoint).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_shutdown_fails_pending_requests() {
        let (mut server, addr) = start_server().await;
        let client = SocketClient::connect(addr, client_config()).await.unwrap();
        client.send_sync(1, Bytes::from_static(b"up")).await.unwrap();

        server.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            client.send_sync(1, Bytes::new()).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SocketClient::connect(addr, client_config()).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[test]
    fn test_io_error_mapping() {
        assert_eq!(ClientError::Timeout.to_io_error().kind(), io::ErrorKind::TimedOut);
        assert_eq!(
            ClientError::Closed.to_io_error().kind(),
            io::ErrorKind::ConnectionReset
        );
        let refused = ClientError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.to_io_error().kind(), io::ErrorKind::ConnectionRefused);
    }
}
