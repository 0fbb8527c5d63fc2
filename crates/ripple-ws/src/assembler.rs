//! Message reassembly (RFC 6455 Section 5.4).
//!
//! A fragmented message is a first frame with FIN clear and a data opcode,
//! zero or more continuation frames, and a final continuation with FIN set.
//! Control frames may arrive between fragments and are handed back
//! immediately without disturbing the pending message.

use crate::error::Closure;
use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct FrameAssembler {
    batch: Vec<Frame>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler::default()
    }

    /// True while a fragmented message is pending.
    pub fn is_assembling(&self) -> bool {
        !self.batch.is_empty()
    }

    /// Feed one physical frame.
    ///
    /// Returns `Some` with a complete message (payloads merged, opcode of the
    /// first fragment, FIN set) or an interleaved control frame, and `None`
    /// while more fragments are needed.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, Closure> {
        if frame.is_control() {
            return Ok(Some(frame));
        }

        if self.batch.is_empty() {
            if frame.is_continuation() {
                return Err(Closure::protocol_error(
                    "Continuation frame with nothing to continue",
                ));
            }
            if frame.fin {
                return Ok(Some(frame));
            }
            self.batch.push(frame);
            return Ok(None);
        }

        if !frame.is_continuation() {
            self.batch.clear();
            return Err(Closure::protocol_error("Continuation frame must have opcode 0"));
        }

        let fin = frame.fin;
        self.batch.push(frame);
        if !fin {
            return Ok(None);
        }

        let total: usize = self.batch.iter().map(|f| f.payload.len()).sum();
        let mut frames = std::mem::take(&mut self.batch).into_iter();
        let mut merged = match frames.next() {
            Some(first) => first,
            None => return Ok(None),
        };
        merged.payload.reserve(total - merged.payload.len());
        for f in frames {
            merged.payload.extend_from_slice(&f.payload);
        }
        merged.fin = true;
        Ok(Some(merged))
    }
}
