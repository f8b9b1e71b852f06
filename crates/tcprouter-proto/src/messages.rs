//! Control stream messages

use serde::{Deserialize, Serialize};

/// Messages carried in `Control` frames on stream 0
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// First message from the client on a fresh control connection.
    ///
    /// `hostname` may be omitted, in which case the router resolves the
    /// hostname from the secret alone.
    Hello {
        version: u32,
        secret: String,
        hostname: Option<String>,
    },
    /// Router accepted the client and registered it for `hostname`
    Ack { hostname: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl ControlMessage {
    pub fn hello(secret: impl Into<String>, hostname: Option<String>) -> Self {
        ControlMessage::Hello {
            version: crate::PROTOCOL_VERSION,
            secret: secret.into(),
            hostname,
        }
    }

    /// Short name for logging, never includes secret material
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "Hello",
            ControlMessage::Ack { .. } => "Ack",
            ControlMessage::Ping { .. } => "Ping",
            ControlMessage::Pong { .. } => "Pong",
        }
    }
}
