//! Client listener: handshake, registration and the per-client receive loop

use crate::error::ControlError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcprouter_connection::{
    framed, read_control, write_control, FrameReader, FrameWriter, MultiplexedConnection,
    MuxConfig, Role,
};
use tcprouter_proto::{ControlMessage, PROTOCOL_VERSION};
use tcprouter_router::{AuthError, ServiceRegistry, TunnelEntry, TunnelRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// State shared by every control connection task
pub(crate) struct ControlContext {
    pub services: Arc<ServiceRegistry>,
    pub registry: Arc<TunnelRegistry>,
    pub handshake_timeout: Duration,
    pub mux_config: MuxConfig,
}

/// Accept client control connections until `cancel` fires
pub(crate) async fn run_listener(
    listener: TcpListener,
    ctx: Arc<ControlContext>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                debug!("New client connection from {}", peer_addr);
                let ctx = ctx.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    match handle_client(socket, peer_addr, &ctx, cancel).await {
                        Ok(()) => {}
                        Err(ControlError::Auth(_)) => {
                            warn!("Rejected client {}: authentication failed", peer_addr)
                        }
                        Err(e) => debug!("Client connection from {} ended: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Client listener accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }

    debug!("Client listener stopped");
}

async fn handle_client(
    socket: TcpStream,
    peer_addr: SocketAddr,
    ctx: &ControlContext,
    cancel: CancellationToken,
) -> Result<(), ControlError> {
    let _ = socket.set_nodelay(true);
    let (mut reader, mut writer) = framed(socket);

    let hostname = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = tokio::time::timeout(
            ctx.handshake_timeout,
            handshake(&mut reader, &mut writer, &ctx.services),
        ) => result.map_err(|_| ControlError::HandshakeTimeout)??,
    };

    let connection =
        MultiplexedConnection::new(reader, writer, Role::Server, ctx.mux_config.clone());
    ctx.registry
        .register(TunnelEntry::new(hostname.clone(), connection.clone(), Some(peer_addr)));
    info!("Tunnel registered for {} from {}", hostname, peer_addr);

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = connection.clone().run_receive_loop() => result,
    };

    connection.close();
    ctx.registry.unregister(&hostname, &connection);
    info!("Tunnel for {} from {} disconnected", hostname, peer_addr);

    result.map_err(ControlError::from)
}

/// Read the client's Hello, authenticate it and answer with Ack.
///
/// Returns the hostname the client is registered for.
async fn handshake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    services: &ServiceRegistry,
) -> Result<String, ControlError> {
    let hello = read_control(reader).await?;
    let kind = hello.kind();
    let ControlMessage::Hello {
        version,
        secret,
        hostname,
    } = hello
    else {
        return Err(ControlError::UnexpectedMessage(kind));
    };

    if version != PROTOCOL_VERSION {
        debug!(
            "Client protocol version {} does not match {}",
            version, PROTOCOL_VERSION
        );
        return Err(AuthError.into());
    }

    let hostname = match hostname {
        Some(hostname) => services.authenticate(&hostname, &secret)?,
        None => services.resolve(&secret)?,
    };

    write_control(writer, &ControlMessage::Ack {
        hostname: hostname.clone(),
    })
    .await?;

    Ok(hostname)
}
