//! Router errors

use tcprouter_connection::MuxError;
use tcprouter_router::{AuthError, SniffError};
use thiserror::Error;

/// Errors that stop the router from starting
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS configuration for {hostname}: {reason}")]
    Tls { hostname: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a public connection was closed without being relayed
#[derive(Debug, Error)]
pub enum PublicError {
    #[error(transparent)]
    Sniff(#[from] SniffError),

    #[error("No tunnel registered for {0}")]
    NoTunnel(String),

    #[error("Tunnel error: {0}")]
    Mux(#[from] MuxError),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a control connection ended
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Expected Hello, got {0}")]
    UnexpectedMessage(&'static str),

    #[error(transparent)]
    Mux(#[from] MuxError),
}
