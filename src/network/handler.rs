//! Server-side hook invoked for every dispatched frame

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;

use crate::protocol::SerializationError;

/// Handler errors; the server answers a failed two-way frame with an empty reply
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Failed(String),
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Processes frame payloads. Runs on dispatch workers, never on the I/O tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one frame. `Ok(None)` means no reply payload.
    async fn handle_message(
        &self,
        command_id: i16,
        payload: &[u8],
        peer: SocketAddr,
    ) -> HandlerResult<Option<Bytes>>;
}
