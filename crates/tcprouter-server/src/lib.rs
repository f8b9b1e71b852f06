//! Public-facing router
//!
//! Accepts public TLS and HTTP connections, sniffs the destination hostname,
//! and relays each connection over the control connection of the client that
//! registered that hostname.

pub mod control;
pub mod error;
pub mod public;
pub mod server;
pub mod tls;

pub use error::ServerError;
pub use public::PublicProtocol;
pub use server::{BoundServer, Server, ServerOptions};
pub use tcprouter_router::{Service, TlsCredential};
