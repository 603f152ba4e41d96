//! Live connections keyed by remote endpoint

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::connection::ConnectionHandle;

/// Pause between peers during a health sweep
pub const CHECK_PAUSE: Duration = Duration::from_millis(2);

/// How long a probed writer may take to answer
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct RegistryInner {
    connections: RwLock<HashMap<SocketAddr, ConnectionHandle>>,
    count: AtomicUsize,
    reply_channels: RwLock<HashMap<SocketAddr, ConnectionHandle>>,
}

/// Thread-safe registry of connection handles plus the reply-channel table
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. A previous connection from the same endpoint is
    /// closed and returned.
    pub async fn add(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections = self.inner.connections.write().await;
        let previous = connections.insert(handle.peer_addr(), handle);
        if let Some(previous) = &previous {
            previous.close();
        } else {
            self.inner.count.fetch_add(1, Ordering::SeqCst);
        }
        previous
    }

    pub async fn remove(&self, addr: &SocketAddr) -> Option<ConnectionHandle> {
        let removed = self.inner.connections.write().await.remove(addr);
        if let Some(handle) = &removed {
            self.inner.count.fetch_sub(1, Ordering::SeqCst);
            self.forget_reply_channels(handle).await;
        }
        removed
    }

    /// Remove the entry only if it still refers to this connection
    pub async fn remove_handle(&self, handle: &ConnectionHandle) -> bool {
        let removed = {
            let mut connections = self.inner.connections.write().await;
            match connections.get(&handle.peer_addr()) {
                Some(current) if current.same_connection(handle) => {
                    connections.remove(&handle.peer_addr());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.inner.count.fetch_sub(1, Ordering::SeqCst);
        }
        self.forget_reply_channels(handle).await;
        removed
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<ConnectionHandle> {
        self.inner.connections.read().await.get(addr).cloned()
    }

    pub async fn contains(&self, addr: &SocketAddr) -> bool {
        self.inner.connections.read().await.contains_key(addr)
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.inner.connections.read().await.values().cloned().collect()
    }

    /// Probe every connection and drop the dead ones. Returns how many were removed.
    pub async fn check_connections(&self) -> usize {
        let mut removed = 0;
        for handle in self.snapshot().await {
            if !handle.probe(PROBE_TIMEOUT).await {
                tracing::debug!("Connection to {} failed health check", handle.peer_addr());
                handle.close();
                if self.remove_handle(&handle).await {
                    removed += 1;
                }
            }
            tokio::time::sleep(CHECK_PAUSE).await;
        }
        removed
    }

    /// Close and forget every connection
    pub async fn purge(&self) {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.inner.connections.write().await;
            self.inner.count.store(0, Ordering::SeqCst);
            connections.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.close();
        }
        self.inner.reply_channels.write().await.clear();
    }

    /// Close and forget connections whose endpoint fails `keep`
    pub async fn purge_not_matching<F>(&self, keep: F) -> usize
    where
        F: Fn(&SocketAddr) -> bool,
    {
        let evicted: Vec<ConnectionHandle> = {
            let mut connections = self.inner.connections.write().await;
            let doomed: Vec<SocketAddr> = connections.keys().filter(|a| !keep(a)).copied().collect();
            doomed
                .iter()
                .filter_map(|addr| connections.remove(addr))
                .collect()
        };

        self.inner.count.fetch_sub(evicted.len(), Ordering::SeqCst);
        for handle in &evicted {
            handle.close();
            self.forget_reply_channels(handle).await;
        }
        evicted.len()
    }

    /// Route replies for `endpoint` through `handle`
    pub async fn set_reply_channel(&self, endpoint: SocketAddr, handle: ConnectionHandle) {
        self.inner.reply_channels.write().await.insert(endpoint, handle);
    }

    /// Live reply channel for `endpoint`, if one is registered
    pub async fn reply_channel(&self, endpoint: &SocketAddr) -> Option<ConnectionHandle> {
        let channel = self.inner.reply_channels.read().await.get(endpoint).cloned()?;
        if channel.is_connected() {
            return Some(channel);
        }
        self.clear_reply_channel(endpoint).await;
        None
    }

    pub async fn clear_reply_channel(&self, endpoint: &SocketAddr) -> Option<ConnectionHandle> {
        self.inner.reply_channels.write().await.remove(endpoint)
    }

    async fn forget_reply_channels(&self, handle: &ConnectionHandle) {
        self.inner
            .reply_channels
            .write()
            .await
            .retain(|_, channel| !channel.same_connection(handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::Outbound;
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Handle whose fake writer answers probes with `alive`
    fn handle(port: u16, alive: bool) -> ConnectionHandle {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Probe(ack) => {
                        let _ = ack.send(alive);
                    }
                    Outbound::Close => break,
                    _ => {}
                }
            }
        });
        ConnectionHandle::new(addr(port), tx)
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = ConnectionRegistry::new();
        let a = handle(1, true);
        assert!(registry.add(a.clone()).await.is_none());
        registry.add(handle(2, true)).await;
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(&addr(1)).await);
        assert!(registry.get(&addr(1)).await.unwrap().same_connection(&a));

        assert!(registry.remove(&addr(1)).await.is_some());
        assert!(registry.remove(&addr(1)).await.is_none());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_replacing_closes_previous() {
        let registry = ConnectionRegistry::new();
        let first = handle(1, true);
        registry.add(first.clone()).await;
        let second = handle(1, true);
        let previous = registry.add(second.clone()).await.unwrap();

        assert!(previous.same_connection(&first));
        assert!(!first.is_connected());
        assert_eq!(registry.count(), 1);

        // A stale handle does not remove its replacement
        assert!(!registry.remove_handle(&first).await);
        assert!(registry.remove_handle(&second).await);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_check_connections_drops_dead_peers() {
        let registry = ConnectionRegistry::new();
        registry.add(handle(1, true)).await;
        let dead = handle(2, false);
        registry.add(dead.clone()).await;

        assert_eq!(registry.check_connections().await, 1);
        assert_eq!(registry.count(), 1);
        assert!(!registry.contains(&addr(2)).await);
        assert!(!dead.is_connected());
    }

    #[tokio::test]
    async fn test_purge_and_purge_not_matching() {
        let registry = ConnectionRegistry::new();
        for port in 1..=4 {
            registry.add(handle(port, true)).await;
        }

        let evicted = registry.purge_not_matching(|a| a.port() % 2 == 0).await;
        assert_eq!(evicted, 2);
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(&addr(2)).await);

        let kept = registry.get(&addr(4)).await.unwrap();
        registry.purge().await;
        assert_eq!(registry.count(), 0);
        assert!(registry.snapshot().await.is_empty());
        assert!(!kept.is_connected());
    }

    #[tokio::test]
    async fn test_reply_channels() {
        let registry = ConnectionRegistry::new();
        let via = handle(1, true);
        registry.add(via.clone()).await;

        let endpoint = addr(9000);
        registry.set_reply_channel(endpoint, via.clone()).await;
        assert!(registry.reply_channel(&endpoint).await.unwrap().same_connection(&via));

        // Removing the carrying connection forgets the channel
        registry.remove_handle(&via).await;
        assert!(registry.reply_channel(&endpoint).await.is_none());

        let closed = handle(2, true);
        registry.set_reply_channel(endpoint, closed.clone()).await;
        closed.close();
        assert!(registry.reply_channel(&endpoint).await.is_none());
        assert!(registry.clear_reply_channel(&endpoint).await.is_none());
    }
}
