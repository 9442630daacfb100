use thiserror::Error;

use crate::protocol::DecodeError;

/// Error types that can occur in the OCPP gateway.
///
/// Protocol-path failures (decode, unknown action) are normally resolved
/// locally by the gateway; these variants surface when a caller of the
/// library API needs to observe them.
#[derive(Error, Debug)]
pub enum OcppgError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A communication channel was closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An inbound frame could not be decoded as an OCPP-J envelope
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// No handler exists for the named action
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A payload was not a JSON object
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A reply referenced a message id with no pending request
    #[error("No pending request for message id {0}")]
    CorrelationMiss(String),

    /// A pending request or backend call exceeded its deadline
    #[error("Timed out")]
    Timeout,

    /// The session was torn down before the operation could complete
    #[error("Session closed")]
    SessionClosed,

    /// No session is registered for the charge point identity
    #[error("Charge point {0} is offline")]
    ChargerOffline(String),

    /// Forwarding to the system of record failed
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP client error while talking to the system of record
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OcppgError>;
