//! Text payload codec.
//!
//! Text frames must carry valid UTF-8 (RFC 6455 Section 5.6). A decode
//! failure is a protocol-level event that closes the connection with 1007,
//! so it is reported as a [`Closure`] rather than a generic error.

use crate::error::Closure;

/// Decode a text payload, consuming the buffer.
pub fn decode(payload: Vec<u8>) -> Result<String, Closure> {
    String::from_utf8(payload).map_err(|e| {
        Closure::invalid_payload(format!(
            "invalid UTF-8 at byte {}",
            e.utf8_error().valid_up_to()
        ))
    })
}

/// Decode a borrowed text payload (close-frame reasons).
pub fn decode_slice(payload: &[u8]) -> Result<&str, Closure> {
    std::str::from_utf8(payload).map_err(|e| {
        Closure::invalid_payload(format!("invalid UTF-8 at byte {}", e.valid_up_to()))
    })
}

pub fn encode(text: &str) -> &[u8] {
    text.as_bytes()
}
