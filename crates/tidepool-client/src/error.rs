//! Error types for the Tidepool client.

use thiserror::Error;

/// Errors that can occur in client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to establish the transport session.
    ///
    /// The core client never retries; a wrapping layer may add backoff.
    #[error("connect failed: {0}")]
    Connect(String),

    /// An operation required a live connection and there was none.
    #[error("not connected")]
    NotConnected,

    /// The socket opened but the identity handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// WebSocket error after the session was established.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (token persistence).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted token could not be decoded.
    #[error("invalid saved token: {0}")]
    InvalidToken(String),

    /// The remote source rejected a subscription.
    ///
    /// Mirrors covered by the subscription stay in their pre-load empty
    /// state; the error is surfaced per-consumer, never process-fatal.
    #[error("subscription {key} rejected: {message}")]
    Subscription { key: String, message: String },

    /// A reducer call was rejected by server-side validation or authorization.
    #[error("reducer {reducer} failed: {message}")]
    Reducer { reducer: String, message: String },

    /// The connection's event loop has shut down while a call was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}
