//! TLS ClientHello parsing
//!
//! Extracts the Server Name Indication from the first handshake message a TLS
//! client sends. Only the plaintext ClientHello is inspected; the router never
//! terminates TLS here.

use thiserror::Error;
use tracing::trace;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// TLS record header: content type, version, length
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext record payload a TLS peer may send
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

/// SNI extraction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Not a TLS handshake record")]
    NotHandshake,

    #[error("Handshake message is not a ClientHello")]
    NotClientHello,

    #[error("Malformed ClientHello: {0}")]
    Malformed(&'static str),

    #[error("ClientHello has no server_name extension")]
    NoServerName,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

/// Try to extract the SNI hostname from buffered bytes.
///
/// Returns `Ok(None)` when more bytes are needed. A ClientHello split over
/// several handshake records is reassembled.
pub fn parse_client_hello(buf: &[u8]) -> Result<Option<String>, SniError> {
    if let Some(&first) = buf.first() {
        if first != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::NotHandshake);
        }
    }

    let mut handshake = Vec::new();
    let mut offset = 0;

    loop {
        if buf.len() < offset + RECORD_HEADER_LEN {
            return Ok(None);
        }

        let header = &buf[offset..offset + RECORD_HEADER_LEN];
        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::NotHandshake);
        }
        if header[1] != 0x03 {
            return Err(SniError::Malformed("unsupported record version"));
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_PAYLOAD {
            return Err(SniError::Malformed("invalid record length"));
        }

        let payload_start = offset + RECORD_HEADER_LEN;
        if buf.len() < payload_start + record_len {
            return Ok(None);
        }
        handshake.extend_from_slice(&buf[payload_start..payload_start + record_len]);
        offset = payload_start + record_len;

        if handshake.len() < 4 {
            continue;
        }
        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(SniError::NotClientHello);
        }
        let body_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
        if handshake.len() >= 4 + body_len {
            return extract_sni(&handshake[4..4 + body_len]).map(Some);
        }
    }
}

/// Extract the SNI hostname from a ClientHello body (after the 4-byte
/// handshake header)
pub fn extract_sni(body: &[u8]) -> Result<String, SniError> {
    let mut reader = Reader::new(body);

    // Legacy version and random
    reader.skip(2 + 32, "truncated random")?;

    let session_id_len = reader.u8("truncated session id")? as usize;
    reader.skip(session_id_len, "truncated session id")?;

    let cipher_suites_len = reader.u16("truncated cipher suites")? as usize;
    reader.skip(cipher_suites_len, "truncated cipher suites")?;

    let compression_len = reader.u8("truncated compression methods")? as usize;
    reader.skip(compression_len, "truncated compression methods")?;

    if reader.remaining() == 0 {
        // No extensions at all
        return Err(SniError::NoServerName);
    }

    let extensions_len = reader.u16("truncated extensions")? as usize;
    let mut extensions = Reader::new(reader.take(extensions_len, "truncated extensions")?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16("truncated extension")?;
        let ext_len = extensions.u16("truncated extension")? as usize;
        let data = extensions.take(ext_len, "truncated extension")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(data);
        }
    }

    Err(SniError::NoServerName)
}

/// Parse the server_name extension data
fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16("truncated server name list")? as usize;
    let mut list = Reader::new(reader.take(list_len, "truncated server name list")?);

    while list.remaining() > 0 {
        let name_type = list.u8("truncated server name")?;
        let name_len = list.u16("truncated server name")? as usize;
        let name = list.take(name_len, "truncated server name")?;

        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let hostname = std::str::from_utf8(name)
            .map_err(|_| SniError::InvalidSni("invalid UTF-8 in hostname".to_string()))?;
        let hostname = crate::normalize_hostname(hostname)
            .ok_or_else(|| SniError::InvalidSni(hostname.to_string()))?;

        trace!("Extracted SNI hostname: {}", hostname);
        return Ok(hostname);
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked cursor over a byte slice
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SniError> {
        if self.remaining() < n {
            return Err(SniError::Malformed(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), SniError> {
        self.take(n, what).map(|_| ())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal single-record ClientHello, optionally with SNI
    fn client_hello(hostname: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0x11; 32]);
        body.push(0x00); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut extensions = Vec::new();
        // An unrelated extension first (supported_versions)
        extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
        if let Some(host) = hostname {
            let name = host.as_bytes();
            let list_len = 3 + name.len();
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0x00);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_sni_extraction() {
        let hello = client_hello(Some("Api.Example.com"));
        assert_eq!(
            parse_client_hello(&hello).unwrap().as_deref(),
            Some("api.example.com")
        );
    }

    #[test]
    fn test_partial_client_hello_needs_more() {
        let hello = client_hello(Some("example.com"));
        for cut in [0, 1, 4, 5, 20, hello.len() - 1] {
            assert_eq!(parse_client_hello(&hello[..cut]), Ok(None), "cut at {}", cut);
        }
    }

    #[test]
    fn test_client_hello_split_across_records() {
        let hello = client_hello(Some("split.example.com"));
        let handshake = &hello[RECORD_HEADER_LEN..];
        let (first, second) = handshake.split_at(10);

        let mut split = Vec::new();
        for part in [first, second] {
            split.extend_from_slice(&[0x16, 0x03, 0x01]);
            split.extend_from_slice(&(part.len() as u16).to_be_bytes());
            split.extend_from_slice(part);
        }

        assert_eq!(
            parse_client_hello(&split).unwrap().as_deref(),
            Some("split.example.com")
        );
    }

    #[test]
    fn test_missing_sni() {
        let hello = client_hello(None);
        assert_eq!(parse_client_hello(&hello), Err(SniError::NoServerName));
    }

    #[test]
    fn test_not_tls() {
        assert_eq!(
            parse_client_hello(b"GET / HTTP/1.1\r\n"),
            Err(SniError::NotHandshake)
        );
    }

    #[test]
    fn test_not_client_hello() {
        let mut hello = client_hello(Some("example.com"));
        hello[RECORD_HEADER_LEN] = 0x02; // ServerHello
        assert_eq!(parse_client_hello(&hello), Err(SniError::NotClientHello));
    }

    #[test]
    fn test_truncated_extension_is_malformed() {
        let mut hello = client_hello(Some("example.com"));
        // Claim a longer extensions block than the body holds, keeping the
        // record and handshake lengths consistent
        let ext_len_pos = RECORD_HEADER_LEN + 4 + 2 + 32 + 1 + 4 + 2;
        hello[ext_len_pos] = 0x7f;
        assert!(matches!(
            parse_client_hello(&hello),
            Err(SniError::Malformed(_))
        ));
    }
}
