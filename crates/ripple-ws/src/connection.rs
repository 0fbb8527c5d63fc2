//! The per-connection engine.
//!
//! ```text
//! accepted socket
//!     |
//!     +-- Transport::accept (TLS handshake if configured)
//!     +-- RequestHead::read
//!     |     +-- no factory for endpoint + fallback set --> FallbackHandler
//!     |     +-- 400 / 405 / 404 on failure
//!     +-- 101 Switching Protocols, on_opened queued
//!     +-- frame loop: read_frame -> FrameAssembler -> dispatch
//!     +-- closure / failure policy, then abort
//! ```
//!
//! Everything here runs on the connection's own thread. Handler callbacks
//! are queued onto the connection's [`Lane`] and run elsewhere.

use std::convert::Infallible;
use std::io::{self, BufReader, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use rustls::ServerConfig;
use tracing::{debug, error, info, trace, warn};

use crate::assembler::FrameAssembler;
use crate::close::CloseData;
use crate::error::{Closure, HandshakeError, WsError};
use crate::executor::{HandlerExecutor, Lane};
use crate::frame::{read_frame, Frame, Opcode};
use crate::handler::{Client, FactoryFn, FallbackHandler, HttpConnection, WebSocketHandler};
use crate::handshake::{compute_accept_key, write_handshake_error, write_upgrade_response, RequestHead};
use crate::payload;
use crate::stream::{Closer, Transport};
use crate::writer::FrameWriter;

/// State shared between the connection thread and [`Client`] handles.
pub(crate) struct Shared {
    pub(crate) writer: FrameWriter,
    closer: Closer,
    closed: AtomicBool,
}

impl Shared {
    /// Claim the close. Only the first caller gets `true`; it writes the
    /// close frame, if one is given, and shuts the socket down.
    pub(crate) fn close_with(&self, frame: Option<(u16, &str)>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some((code, reason)) = frame {
            let _ = self.writer.write_close(code, reason);
        }
        self.closer.close();
        true
    }

    /// Close the socket without a close frame.
    pub(crate) fn abort(&self) -> bool {
        self.close_with(None)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What every connection needs from the server, fixed at start.
pub(crate) struct ConnectionContext {
    pub(crate) factories: FxHashMap<String, FactoryFn>,
    pub(crate) fallback: Option<Arc<dyn FallbackHandler>>,
    pub(crate) executor: HandlerExecutor,
    pub(crate) max_frame_size: usize,
    pub(crate) tls: Option<Arc<ServerConfig>>,
}

/// Queues callbacks for one handler instance onto its lane.
struct Events {
    lane: Lane,
    handler: Arc<Mutex<Box<dyn WebSocketHandler>>>,
}

impl Events {
    fn invoke(&self, f: impl FnOnce(&mut dyn WebSocketHandler) + Send + 'static) {
        let handler = Arc::clone(&self.handler);
        self.lane.execute(move || {
            let mut guard = handler.lock();
            f(&mut **guard)
        });
    }
}

/// Serve one accepted socket to completion.
pub(crate) fn serve(sock: TcpStream, ctx: &ConnectionContext) {
    let transport = match Transport::accept(sock, ctx.tls.as_ref()) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "TLS handshake failed");
            return;
        }
    };
    let Transport {
        reader,
        mut writer,
        closer,
        peer,
    } = transport;
    let peer_str = peer.map_or_else(|| "unknown".to_string(), |p| p.to_string());
    let mut reader = BufReader::new(reader);

    let head = match RequestHead::read(&mut reader) {
        Ok(head) => head,
        Err(e) => {
            log_handshake_error(&peer_str, &e);
            let _ = write_handshake_error(&mut writer, &e);
            closer.close();
            return;
        }
    };

    let factory = ctx.factories.get(&head.headers.endpoint);
    if factory.is_none() {
        if let Some(fallback) = &ctx.fallback {
            debug!(peer = %peer_str, endpoint = %head.headers.endpoint, "passing request to fallback handler");
            let mut conn = HttpConnection::new(head, reader, writer, peer);
            run_fallback(fallback.as_ref(), &mut conn, &peer_str);
            closer.close();
            return;
        }
    }

    let (handler, accept_key) = match negotiate(&head, factory) {
        Ok(v) => v,
        Err(e) => {
            log_handshake_error(&peer_str, &e);
            let _ = write_handshake_error(&mut writer, &e);
            closer.close();
            return;
        }
    };

    info!(peer = %peer_str, endpoint = %head.headers.endpoint, "new WebSocket client");
    trace!(accept_key = %accept_key, "sending handshake response");

    if let Err(e) = write_upgrade_response(&mut writer, &accept_key) {
        error!(peer = %peer_str, error = %e, "failed to send handshake response");
        closer.close();
        return;
    }

    let shared = Arc::new(Shared {
        writer: FrameWriter::new(Box::new(writer), ctx.max_frame_size),
        closer,
        closed: AtomicBool::new(false),
    });
    let events = Events {
        lane: ctx.executor.lane(),
        handler: Arc::new(Mutex::new(handler)),
    };
    let client = Client::new(Arc::clone(&shared), Arc::new(head), peer);
    events.invoke(move |h| h.on_opened(client));

    let err = match run_frames(&mut reader, &shared, &events) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    finish(err, &shared, &events, &peer_str);
    shared.abort();
}

/// Apply the upgrade rules in order: method, upgrade headers, endpoint.
fn negotiate(
    head: &RequestHead,
    factory: Option<&FactoryFn>,
) -> Result<(Box<dyn WebSocketHandler>, String), HandshakeError> {
    if head.method != "GET" {
        return Err(HandshakeError::MethodNotAllowed(head.method.clone()));
    }
    let key = head.headers.validate_upgrade()?;
    let endpoint = &head.headers.endpoint;
    let handler = factory
        .and_then(|create| create())
        .ok_or_else(|| HandshakeError::NotFound(endpoint.clone()))?;
    Ok((handler, compute_accept_key(key)))
}

fn log_handshake_error(peer: &str, err: &HandshakeError) {
    match err {
        HandshakeError::MethodNotAllowed(method) => {
            warn!(peer, method = %method, "WebSocket client used a non-allowed method")
        }
        HandshakeError::Malformed(detail) => {
            warn!(peer, detail = %detail, "WebSocket client sent a malformed request")
        }
        HandshakeError::NotFound(endpoint) => {
            warn!(peer, endpoint = %endpoint, "WebSocket client requested an unknown endpoint")
        }
        HandshakeError::Io(e) => debug!(peer, error = %e, "connection dropped during handshake"),
    }
}

fn run_fallback(fallback: &dyn FallbackHandler, conn: &mut HttpConnection, peer: &str) {
    match fallback.handle(conn) {
        Ok(()) => {}
        Err(HandshakeError::NotFound(what)) => {
            debug!(peer, target = %what, "fallback handler found nothing");
            if !conn.has_responded() {
                let _ = conn.send_response(404, "Not Found", &[]);
            }
        }
        Err(e) => error!(peer, error = %e, "fallback handler failed"),
    }
    let _ = conn.flush();
}

/// Read frames until something ends the connection.
fn run_frames<R: Read>(
    reader: &mut R,
    shared: &Shared,
    events: &Events,
) -> Result<Infallible, WsError> {
    let mut assembler = FrameAssembler::new();
    loop {
        let frame = read_frame(reader)?;
        trace!(
            opcode = frame.opcode,
            len = frame.payload.len(),
            fin = frame.fin,
            "frame received"
        );
        if let Some(message) = assembler.push(frame)? {
            if shared.is_closed() {
                return Err(closed_locally());
            }
            dispatch(message, shared, events)?;
        }
    }
}

fn dispatch(frame: Frame, shared: &Shared, events: &Events) -> Result<(), WsError> {
    match Opcode::from_u8(frame.opcode) {
        Some(Opcode::Text) => {
            let text = payload::decode(frame.payload)?;
            events.invoke(move |h| h.on_text_message(text));
        }
        Some(Opcode::Binary) => {
            let data = frame.payload;
            events.invoke(move |h| h.on_binary_data(data));
        }
        Some(Opcode::Close) => {
            let data = CloseData::parse(&frame.payload)?;
            if !data.is_valid() {
                return Err(Closure::protocol_error(format!(
                    "Invalid close frame code: {}",
                    data.code.unwrap_or_default()
                ))
                .into());
            }
            let code = data.code_or_normal();
            if !shared.close_with(Some((code, ""))) {
                return Err(closed_locally());
            }
            let reason = data.reason;
            events.invoke(move |h| h.on_closed_by_client(code, reason));
            return Err(Closure::from_client(code).into());
        }
        Some(Opcode::Ping) => {
            trace!("got ping frame, sending pong");
            shared.writer.write_pong(&frame.payload)?;
        }
        Some(Opcode::Pong) => trace!("ignoring unsolicited pong frame"),
        _ => {
            return Err(Closure::protocol_error(format!("Invalid opcode: {}", frame.opcode)).into());
        }
    }
    Ok(())
}

fn closed_locally() -> WsError {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed locally").into()
}

/// Close-or-fail policy once the frame loop has ended.
fn finish(err: WsError, shared: &Shared, events: &Events, peer: &str) {
    match err {
        WsError::Closure(closure) => {
            debug!(
                peer,
                code = closure.code,
                reason = %closure.reason,
                detail = closure.detail.as_deref().unwrap_or(""),
                "closing connection"
            );
            // A client close was already answered in dispatch.
            let claimed = shared.close_with(Some((closure.code, &closure.reason)));
            if claimed && !closure.is_from_client() {
                let Closure { code, reason, .. } = closure;
                events.invoke(move |h| h.on_closed_by_server(code, reason));
            }
        }
        WsError::Io(e) => {
            if shared.abort() {
                error!(peer, error = %e, "client socket error");
                events.invoke(move |h| h.on_failure(WsError::Io(e)));
            } else {
                trace!(peer, error = %e, "read ended after local close");
            }
        }
    }
}
