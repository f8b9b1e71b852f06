//! Public TLS and HTTP listeners
//!
//! Each accepted connection gets its own task: sniff the hostname, look up the
//! tunnel, open a stream on it, replay the sniffed bytes and relay.

use crate::error::PublicError;
use crate::tls::{PrefixedStream, TlsTerminator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcprouter_connection::relay;
use tcprouter_router::{sniff_http, sniff_tls, SniffError, Sniffed, TunnelRegistry};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Which opening a public listener expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicProtocol {
    Tls,
    Http,
}

impl std::fmt::Display for PublicProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicProtocol::Tls => write!(f, "TLS"),
            PublicProtocol::Http => write!(f, "HTTP"),
        }
    }
}

/// State shared by every public connection task
pub(crate) struct PublicContext {
    pub registry: Arc<TunnelRegistry>,
    pub terminator: Arc<TlsTerminator>,
    pub sniff_timeout: Duration,
}

/// Accept public connections until `cancel` fires
pub(crate) async fn run_listener(
    listener: TcpListener,
    protocol: PublicProtocol,
    ctx: Arc<PublicContext>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                debug!("New {} connection from {}", protocol, peer_addr);
                let ctx = ctx.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = handle_connection(socket, peer_addr, protocol, &ctx) => {
                            if let Err(e) = result {
                                debug!("{} connection from {} closed: {}", protocol, peer_addr, e);
                            }
                        }
                    }
                });
            }
            Err(e) => {
                error!("{} listener accept error: {}", protocol, e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }

    debug!("{} listener stopped", protocol);
}

async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    protocol: PublicProtocol,
    ctx: &PublicContext,
) -> Result<(), PublicError> {
    let _ = socket.set_nodelay(true);

    let sniffed = tokio::time::timeout(ctx.sniff_timeout, sniff(&mut socket, protocol))
        .await
        .unwrap_or(Err(SniffError::Timeout));

    let Sniffed { hostname, leading } = match sniffed {
        Ok(sniffed) => sniffed,
        Err(e) => {
            if protocol == PublicProtocol::Http
                && matches!(e, SniffError::Protocol(_) | SniffError::NoHostname)
            {
                write_http_error(&mut socket, "400 Bad Request").await;
            }
            return Err(e.into());
        }
    };

    let Some(connection) = ctx.registry.lookup(&hostname) else {
        if protocol == PublicProtocol::Http {
            write_http_error(&mut socket, "502 Bad Gateway").await;
        }
        return Err(PublicError::NoTunnel(hostname));
    };

    // Terminated hosts finish the TLS handshake here, before a stream exists
    if protocol == PublicProtocol::Tls {
        if let Some(acceptor) = ctx.terminator.acceptor(&hostname) {
            let tls_stream = tokio::time::timeout(
                ctx.sniff_timeout,
                acceptor.accept(PrefixedStream::new(leading, socket)),
            )
            .await
            .map_err(|_| PublicError::Sniff(SniffError::Timeout))?
            .map_err(PublicError::TlsHandshake)?;

            let stream = connection.open_stream().await?;
            info!(
                "Routing terminated TLS connection from {} to {} (stream {})",
                peer_addr,
                hostname,
                stream.id()
            );
            let stats = relay(tls_stream, stream).await;
            debug!(
                "Connection from {} to {} finished: {} bytes in, {} bytes out",
                peer_addr, hostname, stats.a_to_b, stats.b_to_a
            );
            return Ok(());
        }
    }

    let mut stream = match connection.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            if protocol == PublicProtocol::Http {
                write_http_error(&mut socket, "502 Bad Gateway").await;
            }
            return Err(e.into());
        }
    };

    info!(
        "Routing {} connection from {} to {} (stream {})",
        protocol,
        peer_addr,
        hostname,
        stream.id()
    );

    stream.write_all(&leading).await?;

    let stats = relay(socket, stream).await;
    debug!(
        "Connection from {} to {} finished: {} bytes in, {} bytes out",
        peer_addr,
        hostname,
        stats.a_to_b + leading.len() as u64,
        stats.b_to_a
    );

    Ok(())
}

async fn sniff(socket: &mut TcpStream, protocol: PublicProtocol) -> Result<Sniffed, SniffError> {
    match protocol {
        PublicProtocol::Tls => sniff_tls(socket).await,
        PublicProtocol::Http => sniff_http(socket).await,
    }
}

/// Best-effort minimal response before closing an HTTP connection
async fn write_http_error(socket: &mut TcpStream, status: &str) {
    let body = format!("{}\n", status);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
