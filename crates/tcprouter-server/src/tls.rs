//! TLS termination for services that carry a certificate
//!
//! The public TLS listener always sniffs the ClientHello first. For hostnames
//! with a configured credential, the sniffed bytes are replayed into a rustls
//! acceptor and the decrypted stream is relayed instead of the raw one.

use crate::error::ServerError;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tcprouter_router::{ServiceRegistry, TlsCredential};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// TLS acceptors keyed by hostname
#[derive(Default)]
pub struct TlsTerminator {
    acceptors: HashMap<String, TlsAcceptor>,
}

impl TlsTerminator {
    /// Build an acceptor for every service that has a credential
    pub fn from_services(services: &ServiceRegistry) -> Result<Self, ServerError> {
        let mut acceptors = HashMap::new();

        for hostname in services.hostnames() {
            let Some(credential) = services.get(hostname).and_then(|s| s.tls.as_ref()) else {
                continue;
            };

            let config = server_config(credential).map_err(|reason| ServerError::Tls {
                hostname: hostname.to_string(),
                reason,
            })?;
            info!("TLS termination enabled for {}", hostname);
            acceptors.insert(hostname.to_string(), TlsAcceptor::from(Arc::new(config)));
        }

        Ok(Self { acceptors })
    }

    pub fn acceptor(&self, hostname: &str) -> Option<&TlsAcceptor> {
        self.acceptors.get(hostname)
    }

    pub fn len(&self) -> usize {
        self.acceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptors.is_empty()
    }
}

/// Parse a PEM credential into a rustls server configuration
pub fn server_config(credential: &TlsCredential) -> Result<ServerConfig, String> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &credential.cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to parse certs: {}", e))?;
    if certs.is_empty() {
        return Err("No certificate found".to_string());
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &credential.key_pem[..])
        .map_err(|e| format!("Failed to parse key: {}", e))?
        .ok_or_else(|| "No private key found".to_string())?;

    ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("Unsupported protocol versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("Invalid cert/key: {}", e))
}

/// A stream that yields `prefix` before reading from `inner`.
///
/// Writes go straight to `inner`.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
