//! Error taxonomy for the live capture pipeline.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors produced by the capture, playback, session, and workflow layers.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The platform refused access to the microphone or camera.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested capture device does not exist or cannot be opened.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Session handshake or transport failure that is not a raw socket error.
    #[error("connection error: {0}")]
    Connection(String),

    /// JSON serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single inbound media chunk could not be decoded. The chunk is
    /// dropped; the pipeline continues.
    #[error("decode error: {0}")]
    Decode(String),

    /// The image-analysis collaborator failed or returned nothing usable.
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// The memory store rejected a write.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Operation requires an open session and none is open.
    #[error("session is not open")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, LiveError>;
