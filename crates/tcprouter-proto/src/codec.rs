//! Codecs for the control connection
//!
//! [`FrameCodec`] turns a byte stream into [`Frame`]s and back; it plugs into
//! `tokio_util::codec::{FramedRead, FramedWrite}`. [`ControlCodec`] encodes the
//! [`ControlMessage`] carried in the payload of control frames.

use crate::messages::ControlMessage;
use crate::mux::{Frame, FrameError, FrameType};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Expected control frame, got {0:?}")]
    NotControl(FrameType),
}

/// Length-prefixed frame codec
///
/// Until [`finish_handshake`](Self::finish_handshake) is called the decoder
/// only accepts small control frames, so an unauthenticated peer cannot make
/// it buffer a large payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
    control_only: bool,
}

impl FrameCodec {
    /// Codec for an established connection
    pub fn new() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE,
            control_only: false,
        }
    }

    /// Codec for a connection that has not completed the handshake
    pub fn handshake() -> Self {
        Self {
            max_frame_size: crate::HANDSHAKE_MAX_FRAME_SIZE,
            control_only: true,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Lift the handshake restrictions
    pub fn finish_handshake(&mut self) {
        self.max_frame_size = crate::MAX_FRAME_SIZE;
        self.control_only = false;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if self.control_only && src.len() >= Frame::HEADER_SIZE {
            let frame_type = FrameType::try_from(src[4]).map_err(CodecError::Frame)?;
            if frame_type != FrameType::Control {
                return Err(CodecError::NotControl(frame_type));
            }
        }
        Ok(Frame::decode_bounded(src, self.max_frame_size)?)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        frame.encode_into(dst)?;
        Ok(())
    }
}

/// Control message codec
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a control message into a control frame
    pub fn encode(msg: &ControlMessage) -> Result<Frame, CodecError> {
        let payload = bincode::serialize(msg)?;
        Ok(Frame::control(Bytes::from(payload)))
    }

    /// Decode the control message carried by `frame`
    pub fn decode(frame: &Frame) -> Result<ControlMessage, CodecError> {
        if frame.frame_type != FrameType::Control {
            return Err(CodecError::NotControl(frame.frame_type));
        }
        Ok(bincode::deserialize(&frame.payload)?)
    }
}
