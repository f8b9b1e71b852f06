//! Tunnel protocol definitions
//!
//! This crate defines the wire format spoken on a control connection between a
//! tcprouter client and the router: the multiplexing frame, the handshake and
//! keepalive messages carried on the control stream, and the codecs for both.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{CodecError, ControlCodec, FrameCodec};
pub use messages::ControlMessage;
pub use mux::{Frame, FrameFlags, FrameType, StreamId};

/// Protocol version, checked during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum frame payload size before the handshake completes
pub const HANDSHAKE_MAX_FRAME_SIZE: u32 = 4 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: StreamId = 0;
