// src/error.rs

//! Unified error type for the protocol runtime.

use thiserror::Error;

/// Errors produced anywhere in the connection/session/handle hierarchy.
///
/// Variants line up with the error kinds of the protocol design: validation
/// and lifecycle errors surface synchronously to the caller, transport and
/// protocol errors close the transaction they belong to, and timeouts cover
/// keepalive misses, ping misses and bare transaction timeouts.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed argument: non-object request, missing required id, empty
    /// plugin descriptor, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation attempted on a destroyed/detached/closed object, or on one
    /// whose destroy/detach is already in progress.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Transport failed to open, send, or dropped unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with `janus: "error"`.
    #[error("{code} {reason}")]
    Protocol {
        /// Janus numeric error code.
        code: i64,
        /// Human-readable reason string from the server.
        reason: String,
    },

    /// A keepalive, ping, or transaction deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Underlying I/O error (TCP, Unix socket, file system).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL could not be parsed or carried an unsupported scheme.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Builds the `{code, reason}` protocol error the spec requires for
    /// inbound `janus: "error"` messages.
    pub fn protocol(code: i64, reason: impl Into<String>) -> Self {
        CoreError::Protocol { code, reason: reason.into() }
    }
}
