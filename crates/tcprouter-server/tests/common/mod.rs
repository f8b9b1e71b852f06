//! Shared fixtures for router end-to-end tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tcprouter_client::{Client, ClientConfig, ClientError};
use tcprouter_connection::MultiplexedConnection;
use tcprouter_router::TunnelRegistry;
use tcprouter_server::{Server, ServerError, ServerOptions, Service};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TestRouter {
    pub tls_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub registry: Arc<TunnelRegistry>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub async fn start_router(services: HashMap<String, Service>) -> TestRouter {
    init_tracing();

    let options = ServerOptions {
        bind_address: Ipv4Addr::LOCALHOST.into(),
        tls_port: 0,
        http_port: 0,
        control_port: 0,
        sniff_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..ServerOptions::default()
    };

    let bound = Server::new(options, services).bind().await.unwrap();
    let cancel = CancellationToken::new();

    TestRouter {
        tls_addr: bound.tls_addr().unwrap(),
        http_addr: bound.http_addr().unwrap(),
        control_addr: bound.control_addr().unwrap(),
        registry: bound.registry(),
        handle: tokio::spawn(bound.run(cancel.clone())),
        cancel,
    }
}

pub fn services(entries: &[(&str, &str)]) -> HashMap<String, Service> {
    entries
        .iter()
        .map(|(host, secret)| (host.to_string(), Service::new(*secret)))
        .collect()
}

pub fn start_client(
    secret: &str,
    local_addr: SocketAddr,
    router: &TestRouter,
    cancel: &CancellationToken,
) -> JoinHandle<Result<(), ClientError>> {
    let config = ClientConfig::new(secret, local_addr.to_string(), router.control_addr.to_string());
    let client = Client::new(config);
    let cancel = cancel.clone();
    tokio::spawn(async move { client.start(cancel).await })
}

/// Wait until `hostname` is served by some tunnel
pub async fn wait_for_tunnel(registry: &TunnelRegistry, hostname: &str) -> Arc<MultiplexedConnection> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(connection) = registry.lookup(hostname) {
                return connection;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnel never registered")
}

/// Read until the end of an HTTP head; returns the head and any bytes after it
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return (String::from_utf8_lossy(&buf).into_owned(), rest);
        }
        let n = reader.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before end of head");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0)
}

/// Backend answering every request with `200 OK` and `body`
pub async fn spawn_http_backend(body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                read_head(&mut socket).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Backend echoing each request body back as the response body
pub async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (head, mut body) = read_head(&mut socket).await;
                let expected = content_length(&head);
                let mut chunk = vec![0u8; 64 * 1024];
                while body.len() < expected {
                    let n = socket.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "request body truncated");
                    body.extend_from_slice(&chunk[..n]);
                }

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Issue one HTTP request with `Connection: close`; returns the status line
/// and the body
pub async fn http_request(addr: SocketAddr, host: &str, body: &[u8]) -> (String, Vec<u8>) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let method = if body.is_empty() { "GET" } else { "POST" };
    let head = format!(
        "{} / HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        method,
        host,
        body.len()
    );

    let (mut read, mut write) = socket.split();
    let send = async {
        write.write_all(head.as_bytes()).await.unwrap();
        write.write_all(body).await.unwrap();
    };
    let receive = async {
        let mut response = Vec::new();
        read.read_to_end(&mut response).await.unwrap();
        response
    };
    let ((), response) = tokio::join!(send, receive);

    let pos = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("incomplete response head");
    let head = String::from_utf8_lossy(&response[..pos]).into_owned();
    let status = head.lines().next().unwrap_or_default().to_string();
    (status, response[pos + 4..].to_vec())
}
