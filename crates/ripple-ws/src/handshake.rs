//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! - [`RequestHead::read`]: parse the request line and headers, any method
//! - [`Headers::read`]: same, but only GET is accepted
//! - [`Headers::validate_upgrade`]: Upgrade/Connection/Version/Key checks
//! - [`compute_accept_key`]: SHA-1 + Base64 per RFC 6455 Section 4.2.2
//! - [`write_response`] / [`write_upgrade_response`]: HTTP status responses

use std::io::{self, BufRead, Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use percent_encoding::percent_decode_str;
use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const SUPPORTED_VERSION: u32 = 13;

pub const SERVER_NAME: &str = "ripple-ws";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const MAX_LINE_LEN: u64 = 8 * 1024;
const MAX_HEADER_LINES: usize = 100;

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Request headers plus the decoded parts of the request target.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    /// Keyed by lowercase name; the value keeps the name as sent.
    fields: FxHashMap<String, (String, String)>,
    pub endpoint: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl Headers {
    /// Read a request head and insist on GET.
    pub fn read<R: BufRead>(reader: &mut R) -> Result<Headers, HandshakeError> {
        let head = RequestHead::read(reader)?;
        if head.method != "GET" {
            return Err(HandshakeError::MethodNotAllowed(head.method));
        }
        Ok(head.headers)
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Header names as the client spelled them, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.values().map(|(name, _)| name.as_str())
    }

    pub fn key(&self) -> Option<&str> {
        self.get("Sec-WebSocket-Key")
    }

    /// Requested protocol version; 0 when missing or unparsable.
    pub fn version(&self) -> u32 {
        self.get("Sec-WebSocket-Version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get("User-Agent")
    }

    pub fn host(&self) -> Option<&str> {
        self.get("Host")
    }

    /// `Upgrade: websocket` and a `Connection` header carrying the `upgrade` token.
    pub fn is_proper_upgrade(&self) -> bool {
        let upgrade = self
            .get("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let connection = self.get("Connection").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        upgrade && connection
    }

    /// Check the upgrade headers and return the client key.
    pub fn validate_upgrade(&self) -> Result<&str, HandshakeError> {
        if !self.is_proper_upgrade() {
            return Err(HandshakeError::Malformed(
                "missing or invalid Upgrade/Connection header".to_string(),
            ));
        }
        let version = self.version();
        if version != SUPPORTED_VERSION {
            return Err(HandshakeError::Malformed(format!(
                "unsupported Sec-WebSocket-Version {}",
                version
            )));
        }
        self.key()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("missing Sec-WebSocket-Key header".to_string()))
    }

    fn insert(&mut self, name: &str, value: &str) {
        self.fields
            .insert(name.to_ascii_lowercase(), (name.to_string(), value.to_string()));
    }
}

/// A parsed request head before any method restriction is applied.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// The request target exactly as sent.
    pub target: String,
    pub http_version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Read the request line and header lines up to the blank line.
    ///
    /// The stream is left positioned at the first byte after the head.
    pub fn read<R: BufRead>(reader: &mut R) -> Result<RequestHead, HandshakeError> {
        let request_line = read_line(reader)?;
        let parts: Vec<&str> = request_line.splitn(3, ' ').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(HandshakeError::Malformed(format!(
                "malformed request line: {:?}",
                request_line
            )));
        }
        let (method, target, http_version) = (parts[0], parts[1], parts[2]);

        let mut headers = parse_target(target)?;

        let mut count = 0;
        loop {
            let line = read_line(reader)?;
            if line.is_empty() {
                break;
            }
            count += 1;
            if count > MAX_HEADER_LINES {
                return Err(HandshakeError::Malformed("too many header lines".to_string()));
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim(), value.trim());
            }
        }

        Ok(RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            http_version: http_version.to_string(),
            headers,
        })
    }
}

/// Split an origin-form target into decoded path, query and fragment.
fn parse_target(target: &str) -> Result<Headers, HandshakeError> {
    if !target.starts_with('/') {
        return Err(HandshakeError::Malformed(format!(
            "unsupported request target: {:?}",
            target
        )));
    }

    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (target, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    Ok(Headers {
        fields: FxHashMap::default(),
        endpoint: decode_component(path)?,
        query: query.map(decode_component).transpose()?,
        fragment: fragment.map(decode_component).transpose()?,
    })
}

fn decode_component(raw: &str) -> Result<String, HandshakeError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| HandshakeError::Malformed(format!("invalid percent-encoding in {:?}", raw)))
}

/// Read one CRLF- or LF-terminated line without the terminator.
fn read_line<R: BufRead>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut buf = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_LINE_LEN + 1)
        .read_until(b'\n', &mut buf)?;

    if buf.last() != Some(&b'\n') {
        if n as u64 > MAX_LINE_LEN {
            return Err(HandshakeError::Malformed("header line too long".to_string()));
        }
        return Err(HandshakeError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before end of request head",
        )));
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| HandshakeError::Malformed("header line is not UTF-8".to_string()))
}

/// Write a complete HTTP/1.1 response head.
///
/// `Server` is always added. Final responses (2xx and up) also carry
/// `Connection: close` and `Content-Length: 0` unless `headers` sets them.
pub fn write_response<W: Write>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &[(&str, &str)],
) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Server: {} {}\r\n", SERVER_NAME, SERVER_VERSION));
    if status >= 200 {
        let has = |wanted: &str| headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(wanted));
        if !has("Connection") {
            head.push_str("Connection: close\r\n");
        }
        if !has("Content-Length") {
            head.push_str("Content-Length: 0\r\n");
        }
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes())?;
    writer.flush()
}

/// Write the `101 Switching Protocols` response.
pub fn write_upgrade_response<W: Write>(writer: &mut W, accept_key: &str) -> io::Result<()> {
    write_response(
        writer,
        101,
        "Switching Protocols",
        &[
            ("Upgrade", "websocket"),
            ("Connection", "upgrade"),
            ("Sec-WebSocket-Accept", accept_key),
        ],
    )
}

/// Answer a failed handshake. I/O failures get no response.
pub fn write_handshake_error<W: Write>(writer: &mut W, err: &HandshakeError) -> io::Result<()> {
    let version = SUPPORTED_VERSION.to_string();
    match (err, err.status()) {
        (HandshakeError::Malformed(_), Some((status, reason))) => write_response(
            writer,
            status,
            reason,
            &[("Sec-WebSocket-Version", version.as_str())],
        ),
        (HandshakeError::MethodNotAllowed(_), Some((status, reason))) => {
            write_response(writer, status, reason, &[("Allow", "GET")])
        }
        (_, Some((status, reason))) => write_response(writer, status, reason, &[]),
        (_, None) => Ok(()),
    }
}
