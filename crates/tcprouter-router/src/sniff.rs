//! Hostname sniffing on freshly accepted public connections
//!
//! Reads just enough of the connection to learn where it should go. Every
//! byte read is returned alongside the hostname so it can be replayed to the
//! backend unchanged.

use crate::http::{self, HttpError};
use crate::sni::{self, SniError};
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Maximum number of bytes buffered while looking for a hostname
pub const MAX_SNIFF_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4 * 1024;

/// Outcome of a successful sniff
#[derive(Debug, Clone)]
pub struct Sniffed {
    /// Normalized destination hostname
    pub hostname: String,
    /// Every byte consumed from the connection, in order
    pub leading: Bytes,
}

/// Sniffing errors
#[derive(Debug, Error)]
pub enum SniffError {
    /// The peer sent something that is not a routable TLS or HTTP opening
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed opening that names no destination (no SNI, no Host)
    #[error("No hostname in connection opening")]
    NoHostname,

    #[error("Timed out waiting for connection opening")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SniffError {
    /// Whether the peer sent bytes that can never be routed
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, SniffError::Protocol(_))
    }
}

impl From<SniError> for SniffError {
    fn from(e: SniError) -> Self {
        match e {
            SniError::NoServerName => SniffError::NoHostname,
            other => SniffError::Protocol(other.to_string()),
        }
    }
}

impl From<HttpError> for SniffError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::HostHeaderNotFound => SniffError::NoHostname,
            other => SniffError::Protocol(other.to_string()),
        }
    }
}

/// Read a TLS ClientHello and return its SNI hostname
pub async fn sniff_tls<R>(reader: &mut R) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    sniff(reader, |buf| Ok(sni::parse_client_hello(buf)?)).await
}

/// Read an HTTP/1.x request head and return its `Host`
pub async fn sniff_http<R>(reader: &mut R) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    sniff(reader, |buf| Ok(http::parse_request_head(buf)?)).await
}

async fn sniff<R, F>(reader: &mut R, parse: F) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<String>, SniffError>,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        if let Some(hostname) = parse(&buf)? {
            trace!("Sniffed hostname {} from {} bytes", hostname, buf.len());
            return Ok(Sniffed {
                hostname,
                leading: buf.freeze(),
            });
        }

        if buf.len() >= MAX_SNIFF_SIZE {
            return Err(SniffError::Protocol(format!(
                "no hostname within the first {} bytes",
                MAX_SNIFF_SIZE
            )));
        }

        // Never read past the sniff bound
        let want = READ_CHUNK.min(MAX_SNIFF_SIZE - buf.len());
        let mut chunk = (&mut *reader).take(want as u64);
        let n = chunk.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(SniffError::Protocol(format!(
                "connection closed after {} bytes, before a hostname was seen",
                buf.len()
            )));
        }
    }
}
