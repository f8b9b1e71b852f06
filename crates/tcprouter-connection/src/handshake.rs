//! Framing helpers used before the multiplexer takes over a connection

use crate::multiplexer::MuxError;
use futures::{SinkExt, StreamExt};
use tcprouter_proto::{ControlCodec, ControlMessage, FrameCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

/// Read half of a control connection
pub type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;

/// Write half of a control connection
pub type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

/// Split a byte stream into framed read and write halves.
///
/// The handshake and the multiplexer share these halves so that frames the
/// peer pipelines right after the handshake are never lost in a buffer. The
/// reader starts in handshake mode (small control frames only);
/// [`MultiplexedConnection::new`](crate::MultiplexedConnection::new) lifts
/// that limit.
pub fn framed<T>(io: T) -> (FrameReader, FrameWriter)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    let read: Box<dyn AsyncRead + Send + Unpin> = Box::new(read);
    let write: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write);
    (
        FramedRead::new(read, FrameCodec::handshake()),
        FramedWrite::new(write, FrameCodec::new()),
    )
}

/// Read the next frame and decode it as a control message
pub async fn read_control(reader: &mut FrameReader) -> Result<ControlMessage, MuxError> {
    let frame = reader.next().await.ok_or(MuxError::ConnectionClosed)??;
    let msg = ControlCodec::decode(&frame)?;
    trace!("Received control message: {}", msg.kind());
    Ok(msg)
}

/// Encode and flush a single control message
pub async fn write_control(writer: &mut FrameWriter, msg: &ControlMessage) -> Result<(), MuxError> {
    trace!("Sending control message: {}", msg.kind());
    writer.send(ControlCodec::encode(msg)?).await?;
    Ok(())
}
