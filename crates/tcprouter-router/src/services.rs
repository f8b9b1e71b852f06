//! Configured services and client authentication

use sha2::{Digest, Sha256};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

/// PEM-encoded certificate chain and private key used to terminate TLS for a
/// service
#[derive(Clone)]
pub struct TlsCredential {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl fmt::Debug for TlsCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredential")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// A hostname the router accepts tunnels for
#[derive(Clone)]
pub struct Service {
    /// Shared secret the serving client must present
    pub client_secret: String,
    /// Terminate TLS on the router instead of passing it through
    pub tls: Option<TlsCredential>,
}

impl Service {
    pub fn new(client_secret: impl Into<String>) -> Self {
        Self {
            client_secret: client_secret.into(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsCredential) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("client_secret", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

/// Authentication failure.
///
/// Deliberately carries no detail: an unknown hostname and a wrong secret look
/// the same to the client.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Authentication failed")]
pub struct AuthError;

struct ServiceEntry {
    service: Service,
    secret_digest: [u8; 32],
}

/// Immutable set of configured services, keyed by normalized hostname
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceEntry>,
    /// Compared against when the hostname is unknown
    dummy_digest: [u8; 32],
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

impl ServiceRegistry {
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = (S, Service)>,
        S: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for (hostname, service) in services {
            let Some(hostname) = crate::normalize_hostname(hostname.as_ref()) else {
                warn!("Ignoring service with invalid hostname {:?}", hostname.as_ref());
                continue;
            };
            if service.client_secret.is_empty() {
                warn!("Service {} has an empty client secret", hostname);
            }
            let secret_digest = digest(&service.client_secret);
            if map.insert(hostname.clone(), ServiceEntry { service, secret_digest }).is_some() {
                warn!("Duplicate service {}, keeping the last definition", hostname);
            }
        }

        let mut seen: BTreeMap<[u8; 32], &str> = BTreeMap::new();
        for (hostname, entry) in &map {
            match seen.entry(entry.secret_digest) {
                Entry::Vacant(slot) => {
                    slot.insert(hostname.as_str());
                }
                Entry::Occupied(first) => warn!(
                    "Services {} and {} share a client secret; clients omitting the hostname get {}",
                    first.get(),
                    hostname,
                    first.get()
                ),
            }
        }

        debug!("Loaded {} service(s)", map.len());

        Self {
            services: map,
            dummy_digest: digest("tcprouter-unknown-service"),
        }
    }

    /// Check `secret` against the service configured for `hostname`
    pub fn authenticate(&self, hostname: &str, secret: &str) -> Result<String, AuthError> {
        let presented = digest(secret);
        let hostname = crate::normalize_hostname(hostname);

        let entry = hostname.as_ref().and_then(|h| self.services.get(h));
        let expected = entry.map_or(&self.dummy_digest, |e| &e.secret_digest);
        let matches: bool = presented.as_slice().ct_eq(expected.as_slice()).into();

        match (hostname, entry.is_some() && matches) {
            (Some(hostname), true) => Ok(hostname),
            _ => Err(AuthError),
        }
    }

    /// Find the hostname whose service uses `secret`.
    ///
    /// Every service is compared so the time taken does not depend on which
    /// one (if any) matches.
    pub fn resolve(&self, secret: &str) -> Result<String, AuthError> {
        let presented = digest(secret);
        let mut found: Option<&String> = None;

        for (hostname, entry) in &self.services {
            let matches: bool = presented
                .as_slice()
                .ct_eq(entry.secret_digest.as_slice())
                .into();
            if matches && found.is_none() {
                found = Some(hostname);
            }
        }

        found.cloned().ok_or(AuthError)
    }

    pub fn get(&self, hostname: &str) -> Option<&Service> {
        self.services.get(hostname).map(|e| &e.service)
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}
