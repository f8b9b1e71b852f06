//! Tunnel client: one control connection to one router

use crate::config::ClientConfig;
use std::io;
use std::time::Duration;
use tcprouter_connection::{
    framed, read_control, relay, write_control, FrameReader, FrameWriter, MultiplexedConnection,
    MuxError, MuxStream, Role,
};
use tcprouter_proto::ControlMessage;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to router {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to router {0}")]
    ConnectTimeout(String),

    #[error("Handshake with router timed out")]
    HandshakeTimeout,

    #[error("Router rejected the client (bad secret or unknown hostname)")]
    Rejected,

    #[error("Unexpected handshake reply: {0}")]
    UnexpectedMessage(&'static str),

    #[error("Handshake with router failed: {0}")]
    Handshake(#[source] MuxError),

    #[error("Failed to reach backend {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Control connection error: {0}")]
    Mux(#[from] MuxError),

    #[error("Control connection closed by router")]
    ConnectionClosed,
}

impl ClientError {
    /// Whether the router refused this client's credentials
    pub fn is_rejected(&self) -> bool {
        matches!(self, ClientError::Rejected)
    }

    /// Whether the tunnel had been registered before this error ended it
    pub fn was_established(&self) -> bool {
        matches!(self, ClientError::ConnectionClosed | ClientError::Mux(_))
    }
}

/// Tunnel client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect, register and serve streams until the connection fails or
    /// `cancel` fires.
    ///
    /// Returns `Ok(())` only on cancellation. Never retries.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let remote = &self.config.remote_addr;

        let socket = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = timeout(self.config.connect_timeout, TcpStream::connect(remote)) => {
                result
                    .map_err(|_| ClientError::ConnectTimeout(remote.clone()))?
                    .map_err(|source| ClientError::Connect {
                        addr: remote.clone(),
                        source,
                    })?
            }
        };
        let _ = socket.set_nodelay(true);
        debug!("Connected to router {}", remote);

        let (mut reader, mut writer) = framed(socket);
        let hostname = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = timeout(
                self.config.handshake_timeout,
                self.handshake(&mut reader, &mut writer),
            ) => result.map_err(|_| ClientError::HandshakeTimeout)??,
        };

        info!(
            "Tunnel established: {} -> {} via {}",
            hostname, self.config.local_addr, remote
        );

        let connection =
            MultiplexedConnection::new(reader, writer, Role::Client, self.config.mux.clone());
        let result = self.serve(&connection, &cancel).await;
        connection.close();

        match &result {
            Ok(()) => info!("Tunnel for {} stopped", hostname),
            Err(e) => warn!("Tunnel for {} via {} lost: {}", hostname, remote, e),
        }
        result
    }

    async fn handshake(
        &self,
        reader: &mut FrameReader,
        writer: &mut FrameWriter,
    ) -> Result<String, ClientError> {
        let hello = ControlMessage::hello(self.config.secret.clone(), self.config.hostname.clone());
        write_control(writer, &hello)
            .await
            .map_err(ClientError::Handshake)?;

        match read_control(reader).await {
            Ok(ControlMessage::Ack { hostname }) => {
                if let Some(requested) = &self.config.hostname {
                    if !requested.eq_ignore_ascii_case(hostname.trim_end_matches('.')) {
                        warn!("Requested {} but router registered {}", requested, hostname);
                    }
                }
                Ok(hostname)
            }
            Ok(other) => Err(ClientError::UnexpectedMessage(other.kind())),
            // The router closes the connection instead of answering a bad Hello
            Err(MuxError::ConnectionClosed) => Err(ClientError::Rejected),
            Err(e) => Err(ClientError::Handshake(e)),
        }
    }

    async fn serve(
        &self,
        connection: &std::sync::Arc<MultiplexedConnection>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let receive = connection.clone().run_receive_loop();
        tokio::pin!(receive);

        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = &mut receive => {
                    return match result {
                        // Only a local close stops the loop cleanly
                        Ok(()) => Err(ClientError::ConnectionClosed),
                        Err(MuxError::ConnectionClosed) => Err(ClientError::ConnectionClosed),
                        Err(e) => Err(e.into()),
                    };
                }
                _ = keepalive.tick() => {
                    match connection.try_ping() {
                        Ok(true) => {}
                        Ok(false) => debug!("Writer queue full, skipping keepalive ping"),
                        Err(e) => debug!("Keepalive ping failed: {}", e),
                    }
                }
                Some(stream) = connection.accept_stream() => {
                    let local_addr = self.config.local_addr.clone();
                    let connect_timeout = self.config.connect_timeout;
                    tokio::spawn(serve_stream(stream, local_addr, connect_timeout));
                }
            }
        }
    }
}

/// Dial the backend for one stream and relay until either side closes.
///
/// A failed dial resets the stream so the router drops the public connection.
async fn serve_stream(stream: MuxStream, local_addr: String, connect_timeout: Duration) {
    let stream_id = stream.id();

    // The router may have closed it while it sat in the accept queue
    if !stream.connection().is_stream_open(stream_id) {
        debug!("Stream {} closed before it was served", stream_id);
        return;
    }

    let backend = match dial(&local_addr, connect_timeout).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Stream {}: {}", stream_id, e);
            if let Err(e) = stream.reset().await {
                debug!("Stream {}: failed to send reset: {}", stream_id, e);
            }
            return;
        }
    };

    debug!("Stream {} connected to backend {}", stream_id, local_addr);
    let stats = relay(stream, backend).await;
    debug!(
        "Stream {} finished: {} bytes to backend, {} bytes from backend",
        stream_id, stats.a_to_b, stats.b_to_a
    );
}

async fn dial(addr: &str, connect_timeout: Duration) -> Result<TcpStream, ClientError> {
    let socket = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Dial {
            addr: addr.to_string(),
            reason: "connection timed out".to_string(),
        })?
        .map_err(|e| ClientError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    let _ = socket.set_nodelay(true);
    Ok(socket)
}
