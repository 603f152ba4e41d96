//! Relay socket server
//!
//! Accepts connections, reassembles frames and hands them to the dispatch
//! queues. Two-way frames are answered on the connection they arrived on, or
//! on the reply channel registered for the sender's endpoint.

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::connection::{
    write_loop, ConnectionError, ConnectionHandle, ConnectionResult, Outbound, OUTBOUND_CHANNEL_SIZE,
};
use super::dispatch::{resolve_worker_count, DispatchQueue};
use super::handler::MessageHandler;
use super::pool::{Pool, Pooled};
use super::registry::ConnectionRegistry;
use crate::config::{ConfigError, ServerConfig};
use crate::protocol::{decode_reply_channel_request, CodecError, Decoder, Encoder, Frame, REPLY_CHANNEL_COMMAND};

/// Sync workers per core when not configured
const SYNC_WORKERS_PER_CORE: usize = 4;

/// Oneway workers per core when not configured
const ONEWAY_WORKERS_PER_CORE: usize = 2;

const LISTEN_BACKLOG: u32 = 1024;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// A new client has connected
    ClientConnected { addr: SocketAddr },
    /// A client has disconnected
    ClientDisconnected { addr: SocketAddr, reason: String },
    /// A connection was refused by the accept policy
    ClientRejected { addr: SocketAddr, reason: String },
    /// Replies for `endpoint` now travel over the connection from `via`
    ReplyChannelRegistered { endpoint: SocketAddr, via: SocketAddr },
    /// Health sweep removed dead connections
    ConnectionsPruned { count: usize },
}

/// Decides whether an incoming connection is accepted
pub type AcceptFilter = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

#[derive(Default)]
struct AcceptPolicy {
    whitelist: Vec<IpAddr>,
    whitelist_only: bool,
    filter: Option<AcceptFilter>,
}

impl AcceptPolicy {
    fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Reason for refusing `addr`, if any
    fn refusal(&self, addr: &SocketAddr) -> Option<&'static str> {
        if self.is_whitelisted(&addr.ip()) {
            return None;
        }
        if self.whitelist_only {
            return Some("not whitelisted");
        }
        match &self.filter {
            Some(filter) if !filter(addr) => Some("refused by accept filter"),
            _ => None,
        }
    }
}

/// A dispatched frame
struct WorkItem {
    sequence: i16,
    command_id: i16,
    reply_expected: bool,
    /// Request bytes; back to the pool when the item is done
    payload: Pooled<BytesMut>,
    peer: SocketAddr,
    origin: ConnectionHandle,
}

/// Runs handlers and routes their replies
struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    registry: ConnectionRegistry,
    encoder: Encoder,
    reply_pool: Pool<BytesMut>,
}

impl Dispatcher {
    async fn process(&self, item: WorkItem) {
        let WorkItem {
            sequence,
            command_id,
            reply_expected,
            payload,
            peer,
            origin,
        } = item;

        let handler = self.handler.clone();
        let outcome =
            tokio::spawn(async move { handler.handle_message(command_id, &payload[..], peer).await })
                .await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::error!("Handler failed for command {} from {}: {}", command_id, peer, e);
                None
            }
            Err(e) => {
                tracing::error!("Handler aborted for command {} from {}: {}", command_id, peer, e);
                None
            }
        };

        if !reply_expected {
            return;
        }

        let mut buf = self.reply_pool.take();
        if let Err(e) = self.encoder.encode_reply(sequence, reply.as_deref(), &mut buf) {
            tracing::error!("Failed to encode reply for {}: {}", peer, e);
            return;
        }

        let target = match self.registry.reply_channel(&peer).await {
            Some(channel) => channel,
            None => origin,
        };
        if let Err(e) = target.send_reply(buf).await {
            tracing::debug!("Reply to {} dropped: {}", peer, e);
        }
    }
}

/// State shared by the accept loop and connection tasks of one run
struct Shared {
    config: ServerConfig,
    registry: ConnectionRegistry,
    policy: Arc<RwLock<AcceptPolicy>>,
    sync_queue: DispatchQueue<WorkItem>,
    oneway_queue: DispatchQueue<WorkItem>,
    request_pool: Pool<BytesMut>,
    receive_pool: Pool<BytesMut>,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        emit(&self.event_tx, event);
    }
}

/// Never blocks; events are dropped while the channel is full
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    let _ = event_tx.try_send(event);
}

/// Relay socket server
pub struct SocketServer {
    /// Server configuration
    config: ServerConfig,
    /// Frame handler
    handler: Arc<dyn MessageHandler>,
    /// Connected clients
    registry: ConnectionRegistry,
    /// Whitelist and accept filter
    policy: Arc<RwLock<AcceptPolicy>>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Create a new server
    pub fn new(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let policy = AcceptPolicy {
            whitelist: config.whitelist.clone(),
            whitelist_only: config.whitelist_only,
            filter: None,
        };

        Self {
            config,
            handler,
            registry: ConnectionRegistry::new(),
            policy: Arc::new(RwLock::new(policy)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
            accept_task: None,
            health_task: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Install a callback consulted for connections outside the whitelist
    pub async fn set_accept_filter(&self, filter: AcceptFilter) {
        self.policy.write().await.filter = Some(filter);
    }

    /// Replace the whitelist. With `whitelist_only`, connected peers outside it
    /// are evicted; returns how many.
    pub async fn set_whitelist(&self, whitelist: Vec<IpAddr>, whitelist_only: bool) -> usize {
        {
            let mut policy = self.policy.write().await;
            policy.whitelist = whitelist.clone();
            policy.whitelist_only = whitelist_only;
        }

        if !whitelist_only {
            return 0;
        }
        let evicted = self
            .registry
            .purge_not_matching(|addr| whitelist.contains(&addr.ip()))
            .await;
        if evicted > 0 {
            tracing::warn!("Evicted {} connections outside the whitelist", evicted);
        }
        evicted
    }

    /// Start the server, returning the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }
        self.config.validate()?;

        let bind_addr = SocketAddr::new(self.config.bind_ip(), self.config.port);
        let listener = bind_listener(bind_addr, &self.config).map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Relay server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let shared = Arc::new(self.build_shared());
        self.health_task = self.spawn_health_check();

        let running = self.running.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => accept_client(stream, addr, &shared).await,
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            shared.sync_queue.close();
            shared.oneway_queue.close();
            shared.registry.purge().await;

            let mut running = running.write().await;
            *running = false;

            shared.emit(ServerEvent::Stopped);
            tracing::info!("Relay server stopped");
        }));

        Ok(local_addr)
    }

    fn build_shared(&self) -> Shared {
        let config = &self.config;
        let dispatcher = Arc::new(Dispatcher {
            handler: self.handler.clone(),
            registry: self.registry.clone(),
            encoder: Encoder::new(config.byte_order()),
            reply_pool: Pool::buffers(
                config.initial_message_size,
                config.maximum_message_size,
                config.buffer_pool_reuses,
            ),
        });

        let sync_workers = resolve_worker_count(config.sync_threads, SYNC_WORKERS_PER_CORE);
        let oneway_workers = resolve_worker_count(config.oneway_threads, ONEWAY_WORKERS_PER_CORE);
        tracing::debug!(
            "Dispatch workers: {} sync, {} oneway",
            sync_workers,
            oneway_workers
        );

        let sync = dispatcher.clone();
        let oneway = dispatcher;
        Shared {
            config: config.clone(),
            registry: self.registry.clone(),
            policy: self.policy.clone(),
            sync_queue: DispatchQueue::start("sync", sync_workers, config.sync_queue_depth, move |item: WorkItem| {
                let dispatcher = sync.clone();
                async move { dispatcher.process(item).await }
            }),
            oneway_queue: DispatchQueue::start("oneway", oneway_workers, config.oneway_queue_depth, move |item: WorkItem| {
                let dispatcher = oneway.clone();
                async move { dispatcher.process(item).await }
            }),
            request_pool: Pool::buffers(
                config.initial_message_size,
                config.maximum_message_size,
                config.buffer_pool_reuses,
            ),
            receive_pool: Pool::buffers(
                config.initial_message_size,
                config.maximum_message_size,
                config.connection_state_reuses,
            ),
            event_tx: self.event_tx.clone(),
        }
    }

    fn spawn_health_check(&self) -> Option<JoinHandle<()>> {
        let secs = self.config.connection_check_interval_secs;
        if secs == 0 {
            return None;
        }

        let registry = self.registry.clone();
        let event_tx = self.event_tx.clone();
        Some(tokio::spawn(async move {
            let period = Duration::from_secs(secs);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let count = registry.check_connections().await;
                if count > 0 {
                    tracing::info!("Health check removed {} dead connections", count);
                    emit(&event_tx, ServerEvent::ConnectionsPruned { count });
                }
            }
        }))
    }

    /// Stop the server and close every connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(task) = self.health_task.take() {
            task.abort();
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        Ok(())
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

fn bind_listener(addr: SocketAddr, config: &ServerConfig) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    // Accepted sockets inherit these
    socket.set_recv_buffer_size(config.receive_buffer_size)?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_client(stream: TcpStream, addr: SocketAddr, shared: &Arc<Shared>) {
    let refusal = shared.policy.read().await.refusal(&addr);
    let refusal = refusal.or_else(|| {
        let max = shared.config.maximum_open_sockets;
        (max > 0 && shared.registry.count() >= max).then_some("too many open sockets")
    });

    if let Some(reason) = refusal {
        tracing::warn!("Refused connection from {}: {}", addr, reason);
        shared.emit(ServerEvent::ClientRejected {
            addr,
            reason: reason.to_string(),
        });
        return;
    }

    tracing::debug!("New connection from {}", addr);
    // Counted against maximum_open_sockets from here on
    let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
    let handle = ConnectionHandle::new(addr, tx);
    shared.registry.add(handle.clone()).await;
    shared.emit(ServerEvent::ClientConnected { addr });

    let shared = shared.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_client(stream, handle, rx, shared).await {
            tracing::debug!("Client handler for {} ended: {}", addr, e);
        }
    });
}

/// Handle a registered client connection
async fn handle_client(
    stream: TcpStream,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
) -> ConnectionResult<()> {
    let addr = handle.peer_addr();
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }
    let (mut reader, writer) = stream.into_split();

    let writer_task = tokio::spawn(write_loop(writer, rx, handle.clone(), shared.config.send_timeout()));

    let result = read_frames(&mut reader, &handle, &shared).await;

    // Clean up
    handle.close();
    shared.registry.remove_handle(&handle).await;
    if let Ok(Err(e)) = writer_task.await {
        tracing::debug!("Writer for {} failed: {}", addr, e);
    }

    let reason = match &result {
        Ok(()) => "Connection closed".to_string(),
        Err(e) => format!("Error: {}", e),
    };
    tracing::debug!("Connection from {} ended: {}", addr, reason);
    shared.emit(ServerEvent::ClientDisconnected { addr, reason });

    result
}

/// Read and dispatch frames until the peer goes away or the connection is closed
async fn read_frames(reader: &mut OwnedReadHalf, handle: &ConnectionHandle, shared: &Shared) -> ConnectionResult<()> {
    let config = &shared.config;
    let mut decoder = Decoder::new(
        config.byte_order(),
        config.initial_message_size,
        config.maximum_message_size,
        config.discard_too_big_messages,
    );
    let mut buf = shared.receive_pool.take();

    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => {
                    handle.record_frame();
                    dispatch_frame(frame, handle, shared).await?;
                }
                Ok(None) => break,
                Err(CodecError::Io(e)) => {
                    buf.mark_corrupted();
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!("Framing error from {}: {}", handle.peer_addr(), e);
                }
            }
        }

        let mid_frame = !(decoder.is_idle() && buf.is_empty());
        let n = tokio::select! {
            n = read_chunk(reader, &mut buf, mid_frame, config.receive_timeout()) => n?,
            _ = handle.closed() => return Ok(()),
        };

        if n == 0 {
            return if mid_frame {
                Err(ConnectionError::Closed)
            } else {
                Ok(())
            };
        }
        handle.record_received(n);
    }
}

async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    mid_frame: bool,
    receive_timeout: Duration,
) -> ConnectionResult<usize> {
    if !mid_frame {
        return Ok(reader.read_buf(buf).await?);
    }
    match tokio::time::timeout(receive_timeout, reader.read_buf(buf)).await {
        Ok(n) => Ok(n?),
        Err(_) => Err(ConnectionError::Timeout),
    }
}

async fn dispatch_frame(frame: Frame, handle: &ConnectionHandle, shared: &Shared) -> ConnectionResult<()> {
    if frame.command_id == REPLY_CHANNEL_COMMAND {
        register_reply_channel(&frame, handle, shared).await;
        return Ok(());
    }

    tracing::debug!(
        "Frame from {}: command {} seq {} ({} bytes)",
        handle.peer_addr(),
        frame.command_id,
        frame.sequence,
        frame.payload.len()
    );

    let mut payload = shared.request_pool.take();
    payload.extend_from_slice(&frame.payload);
    let item = WorkItem {
        sequence: frame.sequence,
        command_id: frame.command_id,
        reply_expected: frame.reply_expected,
        payload,
        peer: handle.peer_addr(),
        origin: handle.clone(),
    };

    let queue = if frame.reply_expected {
        &shared.sync_queue
    } else {
        &shared.oneway_queue
    };

    tokio::select! {
        submitted = queue.submit(item) => submitted.map_err(|e| {
            tracing::warn!("Dropping frame from {}: {}", handle.peer_addr(), e);
            ConnectionError::Closed
        }),
        _ = handle.closed() => Err(ConnectionError::Closed),
    }
}

async fn register_reply_channel(frame: &Frame, handle: &ConnectionHandle, shared: &Shared) {
    let accepted = match decode_reply_channel_request(&frame.payload, shared.config.byte_order()) {
        Some(endpoint) => {
            let endpoint = SocketAddr::V4(endpoint);
            shared.registry.set_reply_channel(endpoint, handle.clone()).await;
            tracing::debug!("Reply channel for {} via {}", endpoint, handle.peer_addr());
            shared.emit(ServerEvent::ReplyChannelRegistered {
                endpoint,
                via: handle.peer_addr(),
            });
            true
        }
        None => {
            tracing::warn!(
                "Malformed reply channel request from {} ({} bytes)",
                handle.peer_addr(),
                frame.payload.len()
            );
            false
        }
    };

    let answer = Bytes::from_static(if accepted { &[1] } else { &[0] });
    if let Err(e) = handle.send_raw(answer).await {
        tracing::debug!("Reply channel answer to {} dropped: {}", handle.peer_addr(), e);
    }
}
