//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! - [`read_frame`]: parse one physical frame from a byte stream, unmasking it
//! - [`write_frame`]: write one unmasked server frame
//! - [`apply_mask`]: symmetric XOR masking per RFC 6455 Section 5.3
//!
//! The reader keeps the opcode as the raw 4-bit value so that reserved
//! opcodes reach the connection engine, which answers them with 1002.

use std::io::{self, Read, Write};

use crate::error::{Closure, WsError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload length accepted from the 64-bit length form.
pub const MAX_FRAME_PAYLOAD: u64 = i32::MAX as u64;

/// Opcodes defined by RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Map a 4-bit value to a known opcode; `None` for reserved values.
    pub fn from_u8(value: u8) -> Option<Opcode> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        is_control(self as u8)
    }
}

/// Control opcodes have the high bit of the 4-bit opcode set.
pub fn is_control(opcode: u8) -> bool {
    opcode & 0x8 != 0
}

/// One physical frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
    pub fin: bool,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>, fin: bool) -> Self {
        Frame {
            opcode: opcode as u8,
            payload: payload.into(),
            fin,
        }
    }

    pub fn is_control(&self) -> bool {
        is_control(self.opcode)
    }

    pub fn is_continuation(&self) -> bool {
        self.opcode == Opcode::Continuation as u8
    }
}

/// Apply or remove the 4-byte XOR mask. Byte `i` uses `key[i % 4]`.
pub fn apply_mask(payload: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Read exactly one frame.
///
/// Framing violations surface as [`WsError::Closure`] with 1002; a stream
/// that ends mid-frame is an I/O error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, WsError> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let mut header = [0u8; 2];
    reader.read_exact(&mut header)?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(Closure::protocol_error("Reserved bits must be 0").into());
    }
    let opcode = header[0] & 0x0F;

    let masked = header[1] & 0x80 != 0;
    let length_byte = header[1] & 0x7F;

    if is_control(opcode) {
        if length_byte as usize > MAX_CONTROL_PAYLOAD {
            return Err(Closure::protocol_error("Control frame payload exceeds 125 bytes").into());
        }
        if !fin {
            return Err(Closure::protocol_error("Control frame must not be fragmented").into());
        }
    }

    let len: u64 = match length_byte {
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            let len = u64::from_be_bytes(buf);
            if len > MAX_FRAME_PAYLOAD {
                return Err(Closure::protocol_error("Frame too large").into());
            }
            len
        }
        n => n as u64,
    };

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key)?;
        Some(key)
    } else {
        None
    };

    // Grow with the data rather than trusting the declared length up front.
    let mut payload = Vec::with_capacity(len.min(64 * 1024) as usize);
    reader.by_ref().take(len).read_to_end(&mut payload)?;
    if (payload.len() as u64) < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame payload truncated: {} of {} bytes", payload.len(), len),
        )
        .into());
    }

    if let Some(key) = mask_key {
        apply_mask(&mut payload, &key);
    }

    Ok(Frame { opcode, payload, fin })
}

/// Encode the header of an unmasked frame into `buf`, returning its length.
fn encode_header(buf: &mut [u8; 10], opcode: Opcode, len: usize, fin: bool) -> usize {
    buf[0] = if fin { 0x80 } else { 0x00 } | opcode as u8;
    if len <= MAX_CONTROL_PAYLOAD {
        buf[1] = len as u8;
        2
    } else if len <= u16::MAX as usize {
        buf[1] = 126;
        buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        buf[1] = 127;
        buf[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    }
}

/// Write one server frame. Servers never mask (RFC 6455 Section 5.1).
pub fn write_frame<W: Write>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
    fin: bool,
) -> io::Result<()> {
    let mut header = [0u8; 10];
    let n = encode_header(&mut header, opcode, payload.len(), fin);
    writer.write_all(&header[..n])?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    Ok(())
}
