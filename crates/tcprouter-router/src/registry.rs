//! Tunnel registry: which control connection currently serves each hostname
//!
//! The most recent registration for a hostname wins. Replacing an entry closes
//! the connection it displaced, and a connection can only remove its own entry,
//! so a stale connection tearing down never evicts its successor.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tcprouter_connection::MultiplexedConnection;
use tracing::{debug, info};

/// A registered tunnel
#[derive(Clone)]
pub struct TunnelEntry {
    pub hostname: String,
    pub connection: Arc<MultiplexedConnection>,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

impl TunnelEntry {
    pub fn new(
        hostname: impl Into<String>,
        connection: Arc<MultiplexedConnection>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            connection,
            peer_addr,
            connected_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for TunnelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEntry")
            .field("hostname", &self.hostname)
            .field("peer_addr", &self.peer_addr)
            .field("connected_at", &self.connected_at)
            .field("active_streams", &self.connection.active_streams())
            .finish()
    }
}

/// Concurrent map from hostname to the control connection serving it
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelEntry>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel, closing whichever connection held the hostname before.
    ///
    /// Returns the displaced entry, if any.
    pub fn register(&self, entry: TunnelEntry) -> Option<TunnelEntry> {
        let hostname = entry.hostname.clone();
        let peer_addr = entry.peer_addr;
        let previous = self.tunnels.insert(hostname.clone(), entry);

        match &previous {
            Some(old) => {
                info!(
                    "Tunnel for {} replaced (old peer {:?}, new peer {:?})",
                    hostname, old.peer_addr, peer_addr
                );
                old.connection.close();
            }
            None => debug!("Tunnel registered for {} from {:?}", hostname, peer_addr),
        }

        previous
    }

    /// Connection currently serving `hostname`, if it is still open
    pub fn lookup(&self, hostname: &str) -> Option<Arc<MultiplexedConnection>> {
        self.tunnels
            .get(hostname)
            .map(|entry| entry.connection.clone())
            .filter(|connection| !connection.is_closed())
    }

    /// Full entry for `hostname`
    pub fn get(&self, hostname: &str) -> Option<TunnelEntry> {
        self.tunnels.get(hostname).map(|entry| entry.clone())
    }

    /// Remove the entry for `hostname` only if it still belongs to `connection`.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, hostname: &str, connection: &Arc<MultiplexedConnection>) -> bool {
        let removed = self
            .tunnels
            .remove_if(hostname, |_, entry| Arc::ptr_eq(&entry.connection, connection))
            .is_some();

        if removed {
            debug!("Tunnel unregistered for {}", hostname);
        }
        removed
    }

    /// Close and forget every registered tunnel
    pub fn close_all(&self) {
        let hostnames: Vec<String> = self.hostnames();
        for hostname in hostnames {
            if let Some((_, entry)) = self.tunnels.remove(&hostname) {
                entry.connection.close();
            }
        }
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcprouter_connection::{framed, MuxConfig, Role};

    fn connection() -> Arc<MultiplexedConnection> {
        let (a, _b) = tokio::io::duplex(1024);
        let (reader, writer) = framed(a);
        MultiplexedConnection::new(reader, writer, Role::Server, MuxConfig::default())
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TunnelRegistry::new();
        let conn = connection();

        assert!(registry.register(TunnelEntry::new("localhost", conn.clone(), None)).is_none());

        let found = registry.lookup("localhost").unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert!(registry.lookup("other").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.hostnames(), vec!["localhost".to_string()]);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = TunnelRegistry::new();
        let first = connection();
        let second = connection();

        registry.register(TunnelEntry::new("localhost", first.clone(), None));
        let displaced = registry
            .register(TunnelEntry::new("localhost", second.clone(), None))
            .unwrap();

        assert!(Arc::ptr_eq(&displaced.connection, &first));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&registry.lookup("localhost").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_successor() {
        let registry = TunnelRegistry::new();
        let first = connection();
        let second = connection();

        registry.register(TunnelEntry::new("localhost", first.clone(), None));
        registry.register(TunnelEntry::new("localhost", second.clone(), None));

        assert!(!registry.unregister("localhost", &first));
        assert!(registry.lookup("localhost").is_some());

        assert!(registry.unregister("localhost", &second));
        assert!(registry.lookup("localhost").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_returned() {
        let registry = TunnelRegistry::new();
        let conn = connection();
        registry.register(TunnelEntry::new("localhost", conn.clone(), None));

        conn.close();
        assert!(registry.lookup("localhost").is_none());
        // Still present until its owner unregisters it
        assert!(registry.get("localhost").is_some());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = TunnelRegistry::new();
        let a = connection();
        let b = connection();
        registry.register(TunnelEntry::new("a.test", a.clone(), None));
        registry.register(TunnelEntry::new("b.test", b.clone(), None));

        registry.close_all();

        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
