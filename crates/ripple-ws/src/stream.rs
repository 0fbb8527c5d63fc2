//! Plain TCP and TLS transports, split into halves.
//!
//! The connection thread owns the [`ReadHalf`] and blocks on it; handler
//! threads write through the [`WriteHalf`] (behind the frame writer's
//! mutex). For TLS both halves share one `rustls::ServerConnection`. The
//! read side never holds that lock across a blocking socket read, so writes
//! are not starved by an idle peer.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::{ServerConfig, ServerConnection};

const TLS_READ_CHUNK: usize = 8 * 1024;

/// A freshly accepted connection, ready for the HTTP handshake.
pub struct Transport {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
    pub closer: Closer,
    pub peer: Option<SocketAddr>,
}

impl Transport {
    /// Wrap an accepted socket, running the TLS handshake first when a
    /// server config is given.
    pub fn accept(sock: TcpStream, tls: Option<&Arc<ServerConfig>>) -> io::Result<Transport> {
        let peer = sock.peer_addr().ok();
        let _ = sock.set_nodelay(true);

        match tls {
            None => Ok(Transport {
                reader: ReadHalf::Plain(sock.try_clone()?),
                writer: WriteHalf::Plain(sock.try_clone()?),
                closer: Closer { sock, tls: None },
                peer,
            }),
            Some(config) => {
                let mut conn = ServerConnection::new(Arc::clone(config))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let mut handshake_sock = sock.try_clone()?;
                while conn.is_handshaking() {
                    conn.complete_io(&mut handshake_sock)?;
                }
                let conn = Arc::new(Mutex::new(conn));
                Ok(Transport {
                    reader: ReadHalf::Tls(TlsReader {
                        conn: Arc::clone(&conn),
                        sock: handshake_sock,
                        raw: vec![0u8; TLS_READ_CHUNK],
                    }),
                    writer: WriteHalf::Tls(TlsWriter {
                        conn: Arc::clone(&conn),
                        sock: sock.try_clone()?,
                    }),
                    closer: Closer {
                        sock,
                        tls: Some(conn),
                    },
                    peer,
                })
            }
        }
    }
}

pub enum ReadHalf {
    Plain(TcpStream),
    Tls(TlsReader),
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Plain(s) => s.read(buf),
            ReadHalf::Tls(s) => s.read(buf),
        }
    }
}

pub enum WriteHalf {
    Plain(TcpStream),
    Tls(TlsWriter),
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Plain(s) => s.write(buf),
            WriteHalf::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Plain(s) => s.flush(),
            WriteHalf::Tls(s) => s.flush(),
        }
    }
}

pub struct TlsReader {
    conn: Arc<Mutex<ServerConnection>>,
    sock: TcpStream,
    raw: Vec<u8>,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut conn = self.conn.lock();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            let n = self.sock.read(&mut self.raw)?;
            if n == 0 {
                return Ok(0);
            }

            let mut conn = self.conn.lock();
            let mut incoming = &self.raw[..n];
            while !incoming.is_empty() {
                conn.read_tls(&mut incoming)?;
                conn.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            // Key updates and alerts may need an answer.
            while conn.wants_write() {
                conn.write_tls(&mut self.sock)?;
            }
        }
    }
}

pub struct TlsWriter {
    conn: Arc<Mutex<ServerConnection>>,
    sock: TcpStream,
}

impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut conn = self.conn.lock();
        let n = conn.writer().write(buf)?;
        while conn.wants_write() {
            conn.write_tls(&mut self.sock)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut conn = self.conn.lock();
        conn.writer().flush()?;
        while conn.wants_write() {
            conn.write_tls(&mut self.sock)?;
        }
        Ok(())
    }
}

/// Tears the socket down from any thread, unblocking a pending read.
pub struct Closer {
    sock: TcpStream,
    tls: Option<Arc<Mutex<ServerConnection>>>,
}

impl Closer {
    pub fn close(&self) {
        if let Some(conn) = &self.tls {
            // A writer blocked mid-record holds the lock; skip close_notify then.
            if let Some(mut conn) = conn.try_lock() {
                conn.send_close_notify();
                let mut sock = &self.sock;
                while conn.wants_write() {
                    if conn.write_tls(&mut sock).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}
