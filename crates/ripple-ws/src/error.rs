//! Error types for the WebSocket engine.
//!
//! [`Closure`] is the signal that ends an open connection with a close
//! frame. The `thiserror` enums cover the remaining failure surfaces:
//! transport ([`WsError`]), handshake ([`HandshakeError`]), TLS material
//! ([`TlsError`]) and server lifecycle ([`ServerError`]).

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::close::CloseCode;

/// Why an open connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    /// The peer broke the framing rules (1002).
    ProtocolError,
    /// A text payload was not valid UTF-8 (1007).
    InvalidPayload,
    /// The peer sent a close frame.
    ClosedByClient,
}

impl ClosureKind {
    pub fn name(self) -> &'static str {
        match self {
            ClosureKind::ProtocolError => "protocol error",
            ClosureKind::InvalidPayload => "invalid payload",
            ClosureKind::ClosedByClient => "closed by client",
        }
    }
}

/// The closure signal raised inside the frame loop.
///
/// Carries the close code and reason that go into the outgoing close frame
/// plus an optional detail that is only logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub kind: ClosureKind,
    pub code: u16,
    pub reason: String,
    pub detail: Option<String>,
}

impl Closure {
    /// A 1002 "Protocol error" closure.
    pub fn protocol_error(detail: impl Into<String>) -> Self {
        Closure {
            kind: ClosureKind::ProtocolError,
            code: CloseCode::PROTOCOL_ERROR,
            reason: "Protocol error".to_string(),
            detail: Some(detail.into()),
        }
    }

    /// A 1007 "Invalid frame payload data" closure.
    pub fn invalid_payload(detail: impl Into<String>) -> Self {
        Closure {
            kind: ClosureKind::InvalidPayload,
            code: CloseCode::INVALID_PAYLOAD,
            reason: "Invalid frame payload data".to_string(),
            detail: Some(detail.into()),
        }
    }

    /// The peer closed with `code`; the reply echoes it with an empty reason.
    pub fn from_client(code: u16) -> Self {
        Closure {
            kind: ClosureKind::ClosedByClient,
            code,
            reason: String::new(),
            detail: Some("Closed by client".to_string()),
        }
    }

    pub fn is_from_client(&self) -> bool {
        self.kind == ClosureKind::ClosedByClient
    }
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.name(), self.code)?;
        if !self.reason.is_empty() {
            write!(f, " {:?}", self.reason)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for Closure {}

/// Failure while an upgraded connection is running.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Closure(#[from] Closure),
}

/// Failure while reading or validating the HTTP upgrade request.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("no handler for endpoint {0:?}")]
    NotFound(String),

    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Status line answering this failure, or `None` when the socket is
    /// unusable and nothing should be written.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            HandshakeError::Malformed(_) => Some((400, "Bad Request")),
            HandshakeError::MethodNotAllowed(_) => Some((405, "Method Not Allowed")),
            HandshakeError::NotFound(_) => Some((404, "Not Found")),
            HandshakeError::Io(_) => None,
        }
    }
}

/// Failure loading certificate or key material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid PEM in {}: {message}", path.display())]
    Pem { path: PathBuf, message: String },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Failure configuring, starting or stopping a [`crate::Server`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("server already started")]
    AlreadyStarted,

    #[error("server is not running")]
    NotRunning,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_carries_1002() {
        let c = Closure::protocol_error("Invalid opcode");
        assert_eq!(c.kind, ClosureKind::ProtocolError);
        assert_eq!(c.code, 1002);
        assert_eq!(c.reason, "Protocol error");
        assert_eq!(c.detail.as_deref(), Some("Invalid opcode"));
        assert!(!c.is_from_client());
    }

    #[test]
    fn test_invalid_payload_carries_1007() {
        let c = Closure::invalid_payload("bad utf-8");
        assert_eq!(c.code, 1007);
        assert_eq!(c.reason, "Invalid frame payload data");
    }

    #[test]
    fn test_from_client_echoes_code_with_empty_reason() {
        let c = Closure::from_client(4000);
        assert!(c.is_from_client());
        assert_eq!(c.code, 4000);
        assert_eq!(c.reason, "");
        assert_eq!(c.detail.as_deref(), Some("Closed by client"));
    }

    #[test]
    fn test_closure_display() {
        let c = Closure::protocol_error("Invalid opcode");
        assert_eq!(c.to_string(), "protocol error (1002) \"Protocol error\": Invalid opcode");
        assert_eq!(
            Closure::from_client(1000).to_string(),
            "closed by client (1000): Closed by client"
        );
    }

    #[test]
    fn test_handshake_status_mapping() {
        assert_eq!(
            HandshakeError::Malformed("x".into()).status(),
            Some((400, "Bad Request"))
        );
        assert_eq!(
            HandshakeError::MethodNotAllowed("POST".into()).status(),
            Some((405, "Method Not Allowed"))
        );
        assert_eq!(
            HandshakeError::NotFound("/x".into()).status(),
            Some((404, "Not Found"))
        );
        let io = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(HandshakeError::Io(io).status(), None);
    }

    #[test]
    fn test_ws_error_from_closure() {
        let err: WsError = Closure::invalid_payload("x").into();
        assert!(matches!(err, WsError::Closure(ref c) if c.code == 1007));
    }
}
