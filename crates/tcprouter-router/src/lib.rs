//! Routing logic for the router
//!
//! Sniffs the destination hostname from the first bytes of a public connection
//! (TLS SNI or HTTP `Host`), authenticates clients against the configured
//! services, and keeps track of which control connection serves which hostname.

pub mod http;
pub mod registry;
pub mod services;
pub mod sni;
pub mod sniff;

pub use registry::{TunnelEntry, TunnelRegistry};
pub use services::{AuthError, Service, ServiceRegistry, TlsCredential};
pub use sniff::{sniff_http, sniff_tls, SniffError, Sniffed, MAX_SNIFF_SIZE};

/// Normalize a hostname for routing: lowercase, no trailing dot.
///
/// Returns `None` for names that cannot be valid DNS hostnames.
pub fn normalize_hostname(name: &str) -> Option<String> {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return None;
    }
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'*'));
    if !valid {
        return None;
    }
    Some(name.to_ascii_lowercase())
}
