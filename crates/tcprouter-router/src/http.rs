//! HTTP/1.x request head parsing
//!
//! Finds the routing hostname in a buffered request head using `httparse`.

use thiserror::Error;
use tracing::trace;

/// Upper bound on headers in a request head
const MAX_HEADERS: usize = 100;

/// HTTP parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("Malformed HTTP request: {0}")]
    Malformed(String),

    #[error("Host header not found")]
    HostHeaderNotFound,

    #[error("Invalid Host header: {0}")]
    InvalidHost(String),
}

/// Try to extract the routing hostname from a buffered request head.
///
/// Returns `Ok(None)` until the blank line ending the head has arrived.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<String>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HttpError::Malformed(e.to_string())),
    }

    let host = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| {
            std::str::from_utf8(h.value)
                .map(|v| v.trim().to_string())
                .map_err(|_| HttpError::InvalidHost("invalid UTF-8".to_string()))
        })
        .transpose()?;

    let host = match host {
        Some(host) => host,
        // Absolute-form target ("GET http://host/ HTTP/1.1") carries the host
        None => request
            .path
            .and_then(authority_from_uri)
            .ok_or(HttpError::HostHeaderNotFound)?
            .to_string(),
    };

    let hostname = normalize_host(&host);
    let hostname =
        crate::normalize_hostname(hostname).ok_or_else(|| HttpError::InvalidHost(host.clone()))?;

    trace!("Extracted HTTP host: {}", hostname);
    Ok(Some(hostname))
}

/// Remove the port from a Host value ("example.com:8080" -> "example.com",
/// "[::1]:8080" -> "::1")
pub fn normalize_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn authority_from_uri(uri: &str) -> Option<&str> {
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    // Drop userinfo
    let authority = authority.rsplit('@').next()?;
    (!authority.is_empty()).then_some(authority)
}
