use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum CrierdError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The engine task is no longer accepting commands.
    #[error("engine unavailable")]
    EngineUnavailable,
    /// Whitelist or event store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
