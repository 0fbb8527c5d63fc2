//! Application-facing contract: handler callbacks, the client handle passed
//! to them, and the fallback for plain HTTP requests.

use std::io::{self, BufReader, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::close::CloseCode;
use crate::connection::Shared;
use crate::error::{HandshakeError, WsError};
use crate::handshake::{write_response, RequestHead};
use crate::stream::{ReadHalf, WriteHalf};

/// Callbacks for one WebSocket connection.
///
/// A fresh instance comes from the endpoint's factory for every connection.
/// Callbacks run on a handler thread, never on the thread reading the
/// socket, and always in the order the events happened. Exactly one of
/// `on_closed_by_client`, `on_closed_by_server` or `on_failure` ends the
/// sequence, unless the handler closed the connection itself.
pub trait WebSocketHandler: Send + 'static {
    fn on_opened(&mut self, client: Client) {
        let _ = client;
    }

    /// The peer sent a close frame. `reason` is `None` when it sent none.
    fn on_closed_by_client(&mut self, code: u16, reason: Option<String>) {
        let _ = (code, reason);
    }

    /// The server closed the connection because the peer broke the protocol.
    fn on_closed_by_server(&mut self, code: u16, reason: String) {
        let _ = (code, reason);
    }

    fn on_failure(&mut self, error: WsError) {
        let _ = error;
    }

    fn on_text_message(&mut self, text: String) {
        let _ = text;
    }

    fn on_binary_data(&mut self, data: Vec<u8>) {
        let _ = data;
    }
}

/// Produces a handler per connection, or `None` to answer 404.
pub(crate) type FactoryFn = Arc<dyn Fn() -> Option<Box<dyn WebSocketHandler>> + Send + Sync>;

/// Handle a handler uses to talk back to its client. Cheap to clone and
/// usable from any thread.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    head: Arc<RequestHead>,
    peer: Option<SocketAddr>,
}

impl Client {
    pub(crate) fn new(shared: Arc<Shared>, head: Arc<RequestHead>, peer: Option<SocketAddr>) -> Self {
        Client { shared, head, peer }
    }

    pub fn send_text_message(&self, text: &str) -> io::Result<()> {
        self.ensure_open()?;
        self.shared.writer.write_text(text)
    }

    pub fn send_binary_data(&self, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        self.shared.writer.write_binary(data)
    }

    /// Send a ping. The payload must fit in a control frame (125 bytes).
    pub fn ping(&self, payload: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        self.shared.writer.write_ping(payload)
    }

    /// Send close 1001 "Going Away" and drop the connection. Messages not
    /// yet dispatched are discarded, and no close or failure callback
    /// follows. Calling it again does nothing.
    pub fn close(&self) {
        self.shared.close_with(Some((CloseCode::GOING_AWAY, "Going Away")));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The decoded request path.
    pub fn endpoint(&self) -> &str {
        &self.head.headers.endpoint
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.head.headers.user_agent()
    }

    pub fn host(&self) -> Option<&str> {
        self.head.headers.host()
    }

    pub fn query(&self) -> Option<&str> {
        self.head.headers.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.head.headers.fragment.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.shared.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed"));
        }
        Ok(())
    }
}

/// Answers requests for endpoints with no registered handler factory.
///
/// Returning [`HandshakeError::NotFound`] makes the server answer 404; any
/// other error is logged and the connection dropped.
pub trait FallbackHandler: Send + Sync + 'static {
    fn handle(&self, conn: &mut HttpConnection) -> Result<(), HandshakeError>;
}

impl<F> FallbackHandler for F
where
    F: Fn(&mut HttpConnection) -> Result<(), HandshakeError> + Send + Sync + 'static,
{
    fn handle(&self, conn: &mut HttpConnection) -> Result<(), HandshakeError> {
        self(conn)
    }
}

/// A plain HTTP request handed to the [`FallbackHandler`].
///
/// The input is positioned right after the request head, so a body can be
/// read from it.
pub struct HttpConnection {
    head: RequestHead,
    input: BufReader<ReadHalf>,
    output: WriteHalf,
    peer: Option<SocketAddr>,
    responded: bool,
}

impl HttpConnection {
    pub(crate) fn new(
        head: RequestHead,
        input: BufReader<ReadHalf>,
        output: WriteHalf,
        peer: Option<SocketAddr>,
    ) -> Self {
        HttpConnection {
            head,
            input,
            output,
            peer,
            responded: false,
        }
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    /// The request target as sent, e.g. `/status?verbose`.
    pub fn uri(&self) -> &str {
        &self.head.target
    }

    /// The decoded path of the request target.
    pub fn endpoint(&self) -> &str {
        &self.head.headers.endpoint
    }

    pub fn query(&self) -> Option<&str> {
        self.head.headers.query.as_deref()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn header_names(&self) -> Vec<&str> {
        self.head.headers.names().collect()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn input(&mut self) -> &mut BufReader<ReadHalf> {
        &mut self.input
    }

    /// Raw output, for writing a body after [`HttpConnection::send_response`].
    pub fn output(&mut self) -> &mut WriteHalf {
        &mut self.output
    }

    /// Write a response head. `Server` is added, and for final responses
    /// `Connection: close` plus `Content-Length: 0` unless given in `headers`.
    pub fn send_response(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[(&str, &str)],
    ) -> io::Result<()> {
        self.responded = true;
        write_response(&mut self.output, status, reason, headers)
    }

    pub(crate) fn has_responded(&self) -> bool {
        self.responded
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}
