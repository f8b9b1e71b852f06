//! Client configuration

use std::fmt;
use std::time::Duration;
use tcprouter_connection::MuxConfig;

/// Tunnel client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Shared secret configured for this client's service on the router
    pub secret: String,
    /// Hostname to register; the router resolves it from the secret if unset
    pub hostname: Option<String>,
    /// Backend every stream is forwarded to (e.g. "127.0.0.1:8080")
    pub local_addr: String,
    /// Router control address (e.g. "router.example.com:4443")
    pub remote_addr: String,
    /// Bound on dialing the router and on dialing the backend
    pub connect_timeout: Duration,
    /// Bound on the Hello/Ack exchange
    pub handshake_timeout: Duration,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    pub mux: MuxConfig,
}

impl ClientConfig {
    pub fn new(
        secret: impl Into<String>,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            secret: secret.into(),
            hostname: None,
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            mux: MuxConfig::default(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("secret", &"<redacted>")
            .field("hostname", &self.hostname)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}
