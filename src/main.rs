//! tcprouter - route public TLS/HTTP traffic by hostname through client tunnels

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::RouterConfig;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tcprouter_client::{Client, ClientConfig};
use tcprouter_connection::{ReconnectConfig, ReconnectManager};
use tcprouter_server::Server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hostname-routing TCP router and its tunnel client
#[derive(Parser, Debug)]
#[command(name = "tcprouter")]
#[command(about = "Route TLS and HTTP traffic by hostname to clients behind NAT", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the router
    #[command(long_about = r#"
Run the router: accept TLS on the TLS port, HTTP on the HTTP port, and tunnel
clients on the client port. Public connections are routed by SNI or Host
header to the client registered for that hostname.

EXAMPLES:
  tcprouter server --config router.yaml
  tcprouter server --config router.yaml --tls-port 8000 --http-port 8001 --client-port 8002
"#)]
    Server {
        /// YAML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Address to bind the listeners on
        #[arg(long)]
        addr: Option<IpAddr>,

        /// Public TLS port
        #[arg(long)]
        tls_port: Option<u16>,

        /// Public HTTP port
        #[arg(long)]
        http_port: Option<u16>,

        /// Port tunnel clients connect to
        #[arg(long)]
        client_port: Option<u16>,
    },

    /// Connect to one or more routers and serve a local backend
    #[command(long_about = r#"
Connect to every --remote router, register with the shared secret, and forward
each routed connection to the --local backend. Reconnects until interrupted.

EXAMPLES:
  tcprouter client --secret foobar --remote router.example.com:4443 --local 127.0.0.1:8080
  TCPROUTER_SECRET=foobar tcprouter client --remote a:4443 --remote b:4443 --local 127.0.0.1:8080
"#)]
    Client {
        /// Secret identifying this client's service
        #[arg(long, env = "TCPROUTER_SECRET", hide_env_values = true)]
        secret: String,

        /// Router client address; repeat to connect to several routers
        #[arg(long, required = true)]
        remote: Vec<String>,

        /// Local backend address
        #[arg(long)]
        local: String,

        /// Hostname to register (resolved from the secret when omitted)
        #[arg(long)]
        hostname: Option<String>,

        /// Delay before reconnecting, in seconds
        #[arg(long, default_value = "5")]
        backoff: u64,

        /// Upper bound for exponential backoff, in seconds (defaults to --backoff)
        #[arg(long)]
        max_backoff: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Commands::Server {
            config,
            addr,
            tls_port,
            http_port,
            client_port,
        } => {
            let file = RouterConfig::load(&config)?;
            let mut options = file.server_options();
            if let Some(addr) = addr {
                options.bind_address = addr;
            }
            if let Some(port) = tls_port {
                options.tls_port = port;
            }
            if let Some(port) = http_port {
                options.http_port = port;
            }
            if let Some(port) = client_port {
                options.control_port = port;
            }

            let services = file.services()?;
            info!("Loaded {} service(s) from {}", services.len(), config.display());

            Server::new(options, services)
                .start(cancel)
                .await
                .context("Router failed")?;
        }
        Commands::Client {
            secret,
            remote,
            local,
            hostname,
            backoff,
            max_backoff,
        } => {
            let reconnect = reconnect_config(backoff, max_backoff);
            let mut supervisors = Vec::with_capacity(remote.len());

            for remote_addr in remote {
                let mut config = ClientConfig::new(secret.clone(), local.clone(), remote_addr);
                config.hostname = hostname.clone();
                supervisors.push(tokio::spawn(supervise(
                    config,
                    reconnect.clone(),
                    cancel.clone(),
                )));
            }

            for supervisor in supervisors {
                if let Err(e) = supervisor.await {
                    error!("Client task panicked: {}", e);
                }
            }
        }
    }

    info!("tcprouter stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!("Error listening for shutdown signal: {}", e),
        }
        cancel.cancel();
    });
}

fn reconnect_config(backoff: u64, max_backoff: Option<u64>) -> ReconnectConfig {
    let delay = Duration::from_secs(backoff);
    match max_backoff {
        Some(max) if max > backoff => ReconnectConfig {
            initial_backoff: delay,
            max_backoff: Duration::from_secs(max),
            ..ReconnectConfig::default()
        },
        _ => ReconnectConfig::constant(delay),
    }
}

/// Keep one client connected to its router until `cancel` fires
async fn supervise(config: ClientConfig, reconnect: ReconnectConfig, cancel: CancellationToken) {
    let remote = config.remote_addr.clone();
    let client = Client::new(config);
    let mut backoff = ReconnectManager::new(reconnect);

    loop {
        match client.start(cancel.clone()).await {
            Ok(()) => return,
            Err(e) => {
                // The tunnel was up; start the next round of retries afresh
                if e.was_established() {
                    backoff.reset();
                }
                if e.is_rejected() {
                    error!("{}: {}", remote, e);
                } else {
                    warn!("{}: {}", remote, e);
                }
            }
        }

        info!("Reconnecting to {} in {:?}", remote, backoff.current_backoff());
        if backoff.wait(&cancel).await.is_err() {
            return;
        }
    }
}
