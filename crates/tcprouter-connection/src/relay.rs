//! Bidirectional byte relay
//!
//! Pumps bytes between two connected streams until either direction ends,
//! then shuts down and drops both. Works for any pair of
//! `AsyncRead + AsyncWrite` streams: a public socket and a [`MuxStream`]
//! on the router, a [`MuxStream`] and a backend socket on the client.
//!
//! [`MuxStream`]: crate::MuxStream

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copy buffer size per direction
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on shutting down one side once the relay is over
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which direction finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

/// Outcome of a relay
#[derive(Debug)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
    /// Direction whose termination ended the relay
    pub finished: Direction,
    /// Error that ended the relay, `None` on a clean EOF
    pub error: Option<io::Error>,
}

/// Relay bytes between `a` and `b` until either side finishes.
///
/// The first direction to hit EOF or an error ends the whole relay: no
/// half-close is kept open. Both streams are shut down and dropped before
/// returning, even if the other direction was idle.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (finished, result) = tokio::select! {
        r = pump(&mut a_read, &mut b_write, &mut a_to_b) => (Direction::AToB, r),
        r = pump(&mut b_read, &mut a_write, &mut b_to_a) => (Direction::BToA, r),
    };

    trace!(
        "Relay finished ({:?}): {} bytes a->b, {} bytes b->a",
        finished,
        a_to_b,
        b_to_a
    );

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, a_write.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, b_write.shutdown()).await;

    RelayStats {
        a_to_b,
        b_to_a,
        finished,
        error: result.err(),
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, transferred: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        // TLS streams buffer records until flushed
        writer.flush().await?;
        *transferred += n as u64;
    }
}
