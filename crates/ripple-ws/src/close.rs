//! Close frame payloads (RFC 6455 Section 5.5.1 and 7.4).

use crate::error::Closure;
use crate::frame::MAX_CONTROL_PAYLOAD;
use crate::payload;

/// Well-known close status codes per RFC 6455 Section 7.4.1.
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reserved; must never appear on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Reserved; must never appear on the wire.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Whether `code` may legally appear in a close frame.
///
/// Application and private ranges (3000-4999) are accepted; the reserved
/// 1004-1006 and the unassigned 1012-2999 are not.
pub fn is_valid_code(code: u16) -> bool {
    match code {
        0..=999 => false,
        1004..=1006 => false,
        1012..=2999 => false,
        5000..=u16::MAX => false,
        _ => true,
    }
}

/// Decoded body of a close frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseData {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl CloseData {
    /// Parse a close frame payload.
    ///
    /// An empty payload carries neither code nor reason. A single byte cannot
    /// hold a code and is a protocol error. The reason must be UTF-8.
    pub fn parse(data: &[u8]) -> Result<CloseData, Closure> {
        match data.len() {
            0 => Ok(CloseData::default()),
            1 => Err(Closure::protocol_error("Invalid close frame payload length")),
            _ => {
                let code = u16::from_be_bytes([data[0], data[1]]);
                let reason = if data.len() > 2 {
                    Some(payload::decode_slice(&data[2..])?.to_string())
                } else {
                    None
                };
                Ok(CloseData {
                    code: Some(code),
                    reason,
                })
            }
        }
    }

    /// A missing code is acceptable; a present one must pass [`is_valid_code`].
    pub fn is_valid(&self) -> bool {
        self.code.map_or(true, is_valid_code)
    }

    /// The code to report, defaulting to 1000 when the peer sent none.
    pub fn code_or_normal(&self) -> u16 {
        self.code.unwrap_or(CloseCode::NORMAL)
    }
}

/// Build a close payload: big-endian code, then the reason cut to fit the
/// 125-byte control frame limit without splitting a UTF-8 sequence.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut out = Vec::with_capacity(2 + cut);
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&reason.as_bytes()[..cut]);
    out
}
