//! Shared error type for synchronous OWTP failures.
//!
//! Protocol-level failures (bad signature, unknown method, timeout, ...) are
//! not errors: they travel as a [`crate::Response`] with a non-success
//! status. `OwtpError` covers what a caller learns before any packet is
//! sent or when the transport itself fails.

use crate::config::ConnectType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OwtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Message queue error: {0}")]
    Mq(String),

    /// The remote refused or failed the connection handshake.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The handshake revealed a different identity than the one dialed.
    #[error("Peer ID mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: String, actual: String },

    #[error("Already listening on {0}")]
    AlreadyListening(ConnectType),

    #[error("Nonce {nonce} already queued for peer {pid}")]
    NonceExists { pid: String, nonce: u64 },

    #[error("Key agreement failed: {0}")]
    KeyAgreementFailed(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node is closed")]
    NodeClosed,
}

/// Alias for OWTP results.
pub type OwtpResult<T> = Result<T, OwtpError>;
