//! Tunnel client
//!
//! Dials the router, registers a hostname with its secret, and serves every
//! stream the router opens by dialing the local backend and relaying bytes.
//! A [`Client`] makes exactly one connection attempt; reconnecting is up to
//! the caller.

pub mod client;
pub mod config;

pub use client::{Client, ClientError};
pub use config::ClientConfig;
