//! Multiplexing frame for the control connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake and keepalive messages, only valid on the control stream
    Control = 0,
    /// Router asks the client to open a new stream
    Open = 1,
    Data = 2,
    Close = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Close),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Stream was reset rather than closed normally (e.g. backend unreachable)
    pub const RST: u8 = 0b0000_0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame-level decoding errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Control frame on data stream {0}")]
    ControlOnDataStream(StreamId),

    #[error("Stream frame on control stream")]
    StreamFrameOnControlStream,
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::Control, payload)
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    /// Close frame marking an abnormal termination
    pub fn reset(stream_id: StreamId) -> Self {
        Self::close(stream_id).with_flags(FrameFlags::new().with_rst())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encoded size of this frame on the wire
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        dst.reserve(self.encoded_len());
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u8(self.flags.as_u8());
        dst.put_u32(payload_len as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode one frame from the front of `src`
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the frame is not yet
    /// complete.
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        Self::decode_bounded(src, crate::MAX_FRAME_SIZE)
    }

    /// Like [`decode_from`](Self::decode_from), rejecting payloads longer than
    /// `max_payload` as soon as the header is readable
    pub fn decode_bounded(src: &mut BytesMut, max_payload: u32) -> Result<Option<Self>, FrameError> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32();

        if length > max_payload {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        match frame_type {
            FrameType::Control if stream_id != crate::CONTROL_STREAM_ID => {
                return Err(FrameError::ControlOnDataStream(stream_id));
            }
            FrameType::Open | FrameType::Data | FrameType::Close
                if stream_id == crate::CONTROL_STREAM_ID =>
            {
                return Err(FrameError::StreamFrameOnControlStream);
            }
            _ => {}
        }

        let total = Self::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), Frame::HEADER_SIZE + payload.len());

        let decoded = Frame::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset_flag_survives_encoding() {
        let frame = Frame::reset(10);
        assert!(frame.flags.has_rst());

        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();
        let decoded = Frame::decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::Close);
        assert!(decoded.flags.has_rst());
        assert!(!Frame::close(10).flags.has_rst());
    }

    #[test]
    fn test_partial_frame_is_left_in_buffer() {
        let mut full = BytesMut::new();
        Frame::data(7, Bytes::from_static(b"abcdef"))
            .encode_into(&mut full)
            .unwrap();

        let mut buf = BytesMut::from(&full[..Frame::HEADER_SIZE + 2]);
        assert!(Frame::decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), Frame::HEADER_SIZE + 2);

        buf.extend_from_slice(&full[Frame::HEADER_SIZE + 2..]);
        let frame = Frame::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcdef");
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        buf.put_u8(0);
        buf.put_u32(0);

        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(FrameError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u8(0);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);

        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(FrameError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_bounded_decode_rejects_on_header() {
        let mut buf = BytesMut::new();
        buf.put_u32(crate::CONTROL_STREAM_ID);
        buf.put_u8(FrameType::Control as u8);
        buf.put_u8(0);
        buf.put_u32(4097);

        assert!(matches!(
            Frame::decode_bounded(&mut buf, 4096),
            Err(FrameError::FrameTooLarge(4097))
        ));
        // Nothing was reserved for the announced payload
        assert!(buf.capacity() < 4096);
    }

    #[test]
    fn test_stream_ids_checked_against_frame_type() {
        let mut buf = BytesMut::new();
        Frame::new(5, FrameType::Control, Bytes::new())
            .encode_into(&mut buf)
            .unwrap();
        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(FrameError::ControlOnDataStream(5))
        ));

        let mut buf = BytesMut::new();
        Frame::open(0).encode_into(&mut buf).unwrap();
        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(FrameError::StreamFrameOnControlStream)
        ));
    }
}
