//! Per-connection frame writer.
//!
//! All physical writes for one connection go through a single
//! [`parking_lot::Mutex`]. One lock acquisition covers every fragment of a
//! message, so concurrent senders never interleave partial messages.

use std::io::{self, Write};

use parking_lot::Mutex;

use crate::close::build_close_payload;
use crate::frame::{write_frame, Opcode, MAX_CONTROL_PAYLOAD};
use crate::payload;

pub struct FrameWriter {
    out: Mutex<Box<dyn Write + Send>>,
    /// 0 disables fragmentation.
    max_frame_size: usize,
}

impl FrameWriter {
    pub fn new(out: Box<dyn Write + Send>, max_frame_size: usize) -> Self {
        FrameWriter {
            out: Mutex::new(out),
            max_frame_size,
        }
    }

    /// Write one logical message.
    ///
    /// Text and binary payloads larger than the maximum frame size are split:
    /// the first frame carries `opcode`, the rest are continuations, and only
    /// the last has FIN set. Control frames are always written whole.
    pub fn write_message(&self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("control frame payload of {} bytes exceeds 125", payload.len()),
            ));
        }

        let max = self.max_frame_size;
        let mut out = self.out.lock();
        if max == 0 || payload.len() <= max || opcode.is_control() {
            write_frame(&mut *out, opcode, payload, true)?;
        } else {
            let mut chunks = payload.chunks(max).peekable();
            let mut op = opcode;
            while let Some(chunk) = chunks.next() {
                let fin = chunks.peek().is_none();
                write_frame(&mut *out, op, chunk, fin)?;
                op = Opcode::Continuation;
            }
        }
        out.flush()
    }

    pub fn write_text(&self, text: &str) -> io::Result<()> {
        self.write_message(Opcode::Text, payload::encode(text))
    }

    pub fn write_binary(&self, data: &[u8]) -> io::Result<()> {
        self.write_message(Opcode::Binary, data)
    }

    pub fn write_ping(&self, payload: &[u8]) -> io::Result<()> {
        self.write_message(Opcode::Ping, payload)
    }

    pub fn write_pong(&self, payload: &[u8]) -> io::Result<()> {
        self.write_message(Opcode::Pong, payload)
    }

    pub fn write_close(&self, code: u16, reason: &str) -> io::Result<()> {
        self.write_message(Opcode::Close, &build_close_payload(code, reason))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::{read_frame, Frame};
    use std::io::Cursor;
    use std::sync::Arc;

    /// A `Write` sink whose bytes can be inspected after the writer owns it.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        pub(crate) fn frames(&self) -> Vec<Frame> {
            let bytes = self.0.lock().clone();
            let len = bytes.len() as u64;
            let mut cursor = Cursor::new(bytes);
            let mut frames = Vec::new();
            while cursor.position() < len {
                frames.push(read_frame(&mut cursor).unwrap());
            }
            frames
        }
    }

    fn writer(max: usize) -> (FrameWriter, SharedBuf) {
        let buf = SharedBuf::default();
        (FrameWriter::new(Box::new(buf.clone()), max), buf)
    }

    #[test]
    fn test_unlimited_writes_single_frame() {
        let (w, buf) = writer(0);
        w.write_binary(&vec![7u8; 100_000]).unwrap();
        let frames = buf.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].payload.len(), 100_000);
    }

    #[test]
    fn test_payload_at_limit_is_not_fragmented() {
        let (w, buf) = writer(126);
        w.write_binary(&[1u8; 126]).unwrap();
        assert_eq!(buf.frames().len(), 1);
    }

    #[test]
    fn test_fragmentation_law() {
        for (n, m) in [(127usize, 126usize), (1000, 126), (1000, 200), (4096, 1024)] {
            let (w, buf) = writer(m);
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            w.write_binary(&payload).unwrap();

            let frames = buf.frames();
            assert_eq!(frames.len(), n.div_ceil(m), "n={} m={}", n, m);
            assert_eq!(frames[0].opcode, Opcode::Binary as u8);
            for (i, f) in frames.iter().enumerate() {
                assert!(f.payload.len() <= m);
                if i > 0 {
                    assert_eq!(f.opcode, 0);
                }
                assert_eq!(f.fin, i == frames.len() - 1);
            }
            let joined: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
            assert_eq!(joined, payload);
        }
    }

    #[test]
    fn test_text_is_fragmented_on_bytes() {
        let (w, buf) = writer(126);
        let text = "\u{e9}".repeat(100);
        w.write_text(&text).unwrap();
        let frames = buf.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, Opcode::Text as u8);
        let joined: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
        assert_eq!(String::from_utf8(joined).unwrap(), text);
    }

    #[test]
    fn test_close_frame_is_never_fragmented() {
        let (w, buf) = writer(126);
        w.write_close(1001, "Going Away").unwrap();
        let frames = buf.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Close as u8);
        assert_eq!(&frames[0].payload[..2], &1001u16.to_be_bytes());
        assert_eq!(&frames[0].payload[2..], b"Going Away");
    }

    #[test]
    fn test_oversized_ping_rejected() {
        let (w, buf) = writer(0);
        let err = w.write_ping(&[0u8; 126]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.0.lock().is_empty());
    }

    #[test]
    fn test_concurrent_messages_do_not_interleave() {
        let (w, buf) = writer(126);
        let w = Arc::new(w);
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let w = Arc::clone(&w);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        w.write_binary(&[t; 600]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let frames = buf.frames();
        let mut current: Option<u8> = None;
        let mut messages = 0;
        for f in frames {
            if f.opcode == Opcode::Binary as u8 {
                assert!(current.is_none());
                current = Some(f.payload[0]);
            } else {
                assert_eq!(f.opcode, 0);
            }
            assert!(f.payload.iter().all(|&b| Some(b) == current));
            if f.fin {
                current = None;
                messages += 1;
            }
        }
        assert_eq!(messages, 80);
    }
}
