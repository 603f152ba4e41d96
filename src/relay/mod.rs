//! Relay module - Relay messages on top of the socket transport
//!
//! Provides:
//! - `RelayMessageHandler` mapping socket commands onto a `DataHandler`
//! - `MemoryStore`, an in-memory `DataHandler`
//! - `RelayClient` for sending messages and reading back outcomes

mod client;
mod handler;
mod store;

pub use client::RelayClient;
pub use handler::{ComponentRuntimeInfo, DataHandler, RelayMessageHandler, RuntimeInfo};
pub use store::MemoryStore;

use thiserror::Error;

use crate::network::ClientError;
use crate::protocol::SerializationError;

/// Relay client errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Transport error: {0}")]
    Client(#[from] ClientError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server sent an empty reply")]
    EmptyReply,
}

pub type RelayResult<T> = Result<T, RelayError>;
