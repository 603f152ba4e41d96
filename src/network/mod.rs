//! Network module - Relay transport over TCP
//!
//! Provides:
//! - Server for accepting connections and dispatching frames to a handler
//! - Client for sending one-way and sync frames
//! - Connection registry, dispatch queues and buffer pools

mod client;
mod connection;
mod dispatch;
mod handler;
mod pool;
mod registry;
mod server;

pub use client::*;
pub use connection::{ConnectionError, ConnectionHandle, ConnectionResult, ConnectionStats, Outbound};
pub use dispatch::*;
pub use handler::*;
pub use pool::*;
pub use registry::*;
pub use server::*;

use std::net::SocketAddr;

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
