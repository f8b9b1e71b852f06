//! Control connection management
//!
//! Runs the multiplexer on top of a single framed control connection, pumps
//! bytes between a multiplexed stream and a socket, and provides the backoff
//! helper used by callers that reconnect.

pub mod handshake;
pub mod multiplexer;
pub mod reconnect;
pub mod relay;

pub use handshake::{framed, read_control, write_control, FrameReader, FrameWriter};
pub use multiplexer::{MultiplexedConnection, MuxConfig, MuxError, MuxStream, Role};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use relay::{relay, RelayStats};
