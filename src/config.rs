//! Router configuration file
//!
//! ```yaml
//! server:
//!   addr: 0.0.0.0
//!   tls_port: 443
//!   http_port: 80
//!   client_port: 4443
//! services:
//!   app.example.com:
//!     client_secret: s3cret
//!   secure.example.com:
//!     client_secret: other
//!     tls_cert: /etc/tcprouter/secure.pem
//!     tls_key: /etc/tcprouter/secure.key
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tcprouter_server::{ServerOptions, Service, TlsCredential};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    pub addr: Option<IpAddr>,
    pub tls_port: Option<u16>,
    pub http_port: Option<u16>,
    pub client_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub client_secret: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl RouterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: RouterConfig = serde_yaml::from_str(content)?;
        if config.services.is_empty() {
            bail!("no services configured");
        }
        Ok(config)
    }

    /// Listener options, with file values overriding the defaults
    pub fn server_options(&self) -> ServerOptions {
        let mut options = ServerOptions::default();
        if let Some(addr) = self.server.addr {
            options.bind_address = addr;
        }
        if let Some(port) = self.server.tls_port {
            options.tls_port = port;
        }
        if let Some(port) = self.server.http_port {
            options.http_port = port;
        }
        if let Some(port) = self.server.client_port {
            options.control_port = port;
        }
        options
    }

    /// Build the service table, reading any TLS credentials from disk
    pub fn services(&self) -> Result<HashMap<String, Service>> {
        self.services
            .iter()
            .map(|(hostname, config)| {
                let service = config
                    .to_service()
                    .with_context(|| format!("Service {}", hostname))?;
                Ok((hostname.clone(), service))
            })
            .collect()
    }
}

impl ServiceConfig {
    fn to_service(&self) -> Result<Service> {
        let service = Service::new(self.client_secret.clone());
        match (&self.tls_cert, &self.tls_key) {
            (None, None) => Ok(service),
            (Some(cert), Some(key)) => {
                let cert_pem = std::fs::read(cert)
                    .with_context(|| format!("Failed to read certificate {}", cert.display()))?;
                let key_pem = std::fs::read(key)
                    .with_context(|| format!("Failed to read private key {}", key.display()))?;
                Ok(service.with_tls(TlsCredential { cert_pem, key_pem }))
            }
            _ => bail!("tls_cert and tls_key must be set together"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal() {
        let config = RouterConfig::parse(
            r#"
services:
  localhost:
    client_secret: foobar
"#,
        )
        .unwrap();

        let options = config.server_options();
        assert_eq!(options.tls_port, 443);
        assert_eq!(options.http_port, 80);
        assert_eq!(options.control_port, 4443);

        let services = config.services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services["localhost"].client_secret, "foobar");
        assert!(services["localhost"].tls.is_none());
    }

    #[test]
    fn test_parse_server_section() {
        let config = RouterConfig::parse(
            r#"
server:
  addr: 127.0.0.1
  tls_port: 8000
  http_port: 8001
  client_port: 8002
services:
  localhost:
    client_secret: foobar
"#,
        )
        .unwrap();

        let options = config.server_options();
        assert_eq!(options.bind_address.to_string(), "127.0.0.1");
        assert_eq!(options.tls_port, 8000);
        assert_eq!(options.http_port, 8001);
        assert_eq!(options.control_port, 8002);
    }

    #[test]
    fn test_reject_empty_and_unknown_fields() {
        assert!(RouterConfig::parse("server:\n  tls_port: 1\n").is_err());
        assert!(RouterConfig::parse(
            "services:\n  localhost:\n    client_secret: a\n    secret: b\n"
        )
        .is_err());
    }

    #[test]
    fn test_load_tls_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, b"CERT").unwrap();
        std::fs::write(&key, b"KEY").unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "services:\n  secure.test:\n    client_secret: s\n    tls_cert: {}\n    tls_key: {}\n",
            cert.display(),
            key.display()
        )
        .unwrap();

        let config = RouterConfig::load(file.path()).unwrap();
        let services = config.services().unwrap();
        let tls = services["secure.test"].tls.as_ref().unwrap();
        assert_eq!(tls.cert_pem, b"CERT");
        assert_eq!(tls.key_pem, b"KEY");
    }

    #[test]
    fn test_tls_requires_both_files() {
        let config = RouterConfig::parse(
            "services:\n  secure.test:\n    client_secret: s\n    tls_cert: /nonexistent.pem\n",
        )
        .unwrap();
        let err = config.services().unwrap_err();
        assert!(format!("{:#}", err).contains("must be set together"));
    }

    #[test]
    fn test_missing_file() {
        let err = RouterConfig::load(Path::new("/nonexistent/tcprouter.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
