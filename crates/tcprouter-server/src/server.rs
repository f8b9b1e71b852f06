//! Router façade: binds the three listeners and runs them until cancelled

use crate::control::{self, ControlContext};
use crate::error::ServerError;
use crate::public::{self, PublicContext, PublicProtocol};
use crate::tls::TlsTerminator;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tcprouter_connection::MuxConfig;
use tcprouter_router::{Service, ServiceRegistry, TunnelRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Router configuration
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: IpAddr,
    /// Public port for TLS (SNI) traffic
    pub tls_port: u16,
    /// Public port for plain HTTP traffic
    pub http_port: u16,
    /// Port clients dial to register tunnels
    pub control_port: u16,
    /// Upper bound on reading a public connection's opening
    pub sniff_timeout: Duration,
    /// Upper bound on a client's Hello/Ack exchange
    pub handshake_timeout: Duration,
    pub mux: MuxConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tls_port: 443,
            http_port: 80,
            control_port: 4443,
            sniff_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            mux: MuxConfig::default(),
        }
    }
}

pub struct Server {
    options: ServerOptions,
    services: Arc<ServiceRegistry>,
    registry: Arc<TunnelRegistry>,
}

impl Server {
    pub fn new(options: ServerOptions, services: HashMap<String, Service>) -> Self {
        Self {
            options,
            services: Arc::new(ServiceRegistry::new(services)),
            registry: Arc::new(TunnelRegistry::new()),
        }
    }

    /// Registry of live tunnels, for diagnostics
    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn services(&self) -> Arc<ServiceRegistry> {
        self.services.clone()
    }

    /// Bind all listeners, then serve until `cancel` fires
    pub async fn start(self, cancel: CancellationToken) -> Result<(), ServerError> {
        self.bind().await?.run(cancel).await
    }

    /// Bind all listeners and load TLS credentials without serving yet
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let terminator = TlsTerminator::from_services(&self.services)?;

        let ip = self.options.bind_address;
        let tls = bind(SocketAddr::new(ip, self.options.tls_port)).await?;
        let http = bind(SocketAddr::new(ip, self.options.http_port)).await?;
        let control = bind(SocketAddr::new(ip, self.options.control_port)).await?;

        Ok(BoundServer {
            tls,
            http,
            control,
            terminator: Arc::new(terminator),
            server: self,
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    })
}

/// A router whose listeners are bound but not yet accepting
pub struct BoundServer {
    tls: TcpListener,
    http: TcpListener,
    control: TcpListener,
    terminator: Arc<TlsTerminator>,
    server: Server,
}

impl BoundServer {
    pub fn tls_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.tls.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.http.local_addr()?)
    }

    pub fn control_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.control.local_addr()?)
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.server.registry()
    }

    /// Serve until `cancel` fires, then close every listener and tunnel
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let BoundServer {
            tls,
            http,
            control,
            terminator,
            server,
        } = self;

        info!(
            "Router listening: TLS on {}, HTTP on {}, clients on {} ({} service(s))",
            tls.local_addr()?,
            http.local_addr()?,
            control.local_addr()?,
            server.services.len()
        );

        let public_ctx = Arc::new(PublicContext {
            registry: server.registry.clone(),
            terminator,
            sniff_timeout: server.options.sniff_timeout,
        });
        let control_ctx = Arc::new(ControlContext {
            services: server.services.clone(),
            registry: server.registry.clone(),
            handshake_timeout: server.options.handshake_timeout,
            mux_config: server.options.mux.clone(),
        });

        // Listener sockets are dropped as each loop returns
        tokio::join!(
            public::run_listener(tls, PublicProtocol::Tls, public_ctx.clone(), cancel.clone()),
            public::run_listener(http, PublicProtocol::Http, public_ctx, cancel.clone()),
            control::run_listener(control, control_ctx, cancel.clone()),
        );

        let tunnels = server.registry.len();
        server.registry.close_all();
        info!("Router stopped, closed {} tunnel(s)", tunnels);

        Ok(())
    }
}
