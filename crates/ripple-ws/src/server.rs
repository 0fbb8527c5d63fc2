//! The listening server: endpoint registration, accept loop, stop.
//!
//! One accept thread per server and one thread per accepted connection.
//! Registrations are frozen by [`Server::start`]; connections read an
//! immutable snapshot of them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::connection::{self, ConnectionContext};
use crate::error::{HandshakeError, ServerError};
use crate::executor::HandlerExecutor;
use crate::handler::{FactoryFn, FallbackHandler, HttpConnection, WebSocketHandler};
use crate::options::Options;

/// Listen queue length when none is configured.
const DEFAULT_BACKLOG: i32 = 50;

/// A WebSocket server.
///
/// ```no_run
/// use ripple_ws::{Client, Options, Server, WebSocketHandler};
///
/// struct Echo(Option<Client>);
///
/// impl WebSocketHandler for Echo {
///     fn on_opened(&mut self, client: Client) {
///         self.0 = Some(client);
///     }
///     fn on_text_message(&mut self, text: String) {
///         if let Some(c) = &self.0 {
///             let _ = c.send_text_message(&text);
///         }
///     }
/// }
///
/// let mut server = Server::new(Options::builder(9001).build().unwrap());
/// server.add_handler_factory("/", || Some(Echo(None))).unwrap();
/// server.start().unwrap();
/// server.join();
/// ```
pub struct Server {
    options: Options,
    factories: FxHashMap<String, FactoryFn>,
    fallback: Option<Arc<dyn FallbackHandler>>,
    started: bool,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(options: Options) -> Self {
        Server {
            options,
            factories: FxHashMap::default(),
            fallback: None,
            started: false,
            running: None,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Register a handler factory for an exact request path. The factory
    /// runs once per connection; returning `None` answers 404.
    pub fn add_handler_factory<F, H>(
        &mut self,
        endpoint: impl Into<String>,
        factory: F,
    ) -> Result<(), ServerError>
    where
        F: Fn() -> Option<H> + Send + Sync + 'static,
        H: WebSocketHandler,
    {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }
        let factory: FactoryFn =
            Arc::new(move || factory().map(|h| Box::new(h) as Box<dyn WebSocketHandler>));
        self.factories.insert(endpoint.into(), factory);
        Ok(())
    }

    /// Handle requests whose path has no handler factory.
    pub fn set_fallback_handler<F>(&mut self, handler: F) -> Result<(), ServerError>
    where
        F: Fn(&mut HttpConnection) -> Result<(), HandshakeError> + Send + Sync + 'static,
    {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }
        self.fallback = Some(Arc::new(handler));
        Ok(())
    }

    /// Bind the listener and start accepting on a background thread.
    ///
    /// Bind failures are returned here. Returns the bound address, which
    /// differs from the configured one when port 0 was requested.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.options.socket_addr();
        let backlog = self
            .options
            .backlog()
            .map_or(DEFAULT_BACKLOG, |b| b.min(i32::MAX as u32) as i32);
        let listener = bind_listener(addr, backlog).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let dispatch = self.options.dispatch().cloned();
        let executor = HandlerExecutor::new(self.options.handler_threads(), dispatch.clone())?;
        let ctx = Arc::new(ConnectionContext {
            factories: std::mem::take(&mut self.factories),
            fallback: self.fallback.take(),
            executor,
            max_frame_size: self.options.max_frame_size(),
            tls: self.options.tls().cloned(),
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name(format!("ripple-accept-{}", local_addr.port()))
            .spawn(move || {
                crate::with_dispatch(dispatch.as_ref(), || {
                    info!(addr = %local_addr, tls = ctx.tls.is_some(), "WebSocket server listening");
                    accept_loop(listener, ctx, accept_shutdown, dispatch.clone())
                })
            })?;

        self.started = true;
        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
        });
        Ok(local_addr)
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop accepting. Open connections keep running until they end.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let mut running = self.running.take().ok_or(ServerError::NotRunning)?;
        running.shutdown.store(true, Ordering::Release);

        // Wake the blocking accept() so it sees the flag.
        let wake = wake_addr(running.local_addr);
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            warn!(addr = %wake, error = %e, "could not wake accept loop");
        }
        if let Some(handle) = running.accept_thread.take() {
            if handle.join().is_err() {
                error!("accept thread panicked");
            }
        }
        Ok(())
    }

    /// Block until the accept loop ends.
    pub fn join(&mut self) {
        let handle = self
            .running
            .as_mut()
            .and_then(|r| r.accept_thread.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop();
        }
    }
}

/// Bind with an explicit listen backlog.
fn bind_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// A connectable address for a listener that may be bound to the
/// unspecified address.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    shutdown: Arc<AtomicBool>,
    dispatch: Option<tracing::Dispatch>,
) {
    let mut next_id: u64 = 0;
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match incoming {
            Ok(sock) => {
                next_id += 1;
                let ctx = Arc::clone(&ctx);
                let dispatch = dispatch.clone();
                let spawned = thread::Builder::new()
                    .name(format!("ripple-conn-{}", next_id))
                    .spawn(move || {
                        crate::with_dispatch(dispatch.as_ref(), || connection::serve(sock, &ctx))
                    });
                if let Err(e) = spawned {
                    error!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(e) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                error!(error = %e, "accept failed");
                // Avoid spinning when out of file descriptors.
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl WebSocketHandler for Noop {}

    fn local_options() -> Options {
        Options::builder(0)
            .bind_address("127.0.0.1".parse().unwrap())
            .handler_threads(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_registration_frozen_after_start() {
        let mut server = Server::new(local_options());
        server.add_handler_factory("/", || Some(Noop)).unwrap();
        server.start().unwrap();
        assert!(matches!(
            server.add_handler_factory("/late", || Some(Noop)),
            Err(ServerError::AlreadyStarted)
        ));
        assert!(matches!(
            server.set_fallback_handler(|_conn: &mut HttpConnection| Ok(())),
            Err(ServerError::AlreadyStarted)
        ));
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        server.stop().unwrap();
    }

    #[test]
    fn test_start_reports_bound_port() {
        let mut server = Server::new(local_options());
        let addr = server.start().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(TcpStream::connect(addr).is_ok());
        server.stop().unwrap();
        assert!(!server.is_running());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let opts = Options::builder(port)
            .bind_address("127.0.0.1".parse().unwrap())
            .build()
            .unwrap();
        let mut server = Server::new(opts);
        match server.start() {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
            other => panic!("expected bind error, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_closes_listener() {
        let mut server = Server::new(local_options());
        let addr = server.start().unwrap();
        server.stop().unwrap();
        assert!(matches!(server.stop(), Err(ServerError::NotRunning)));
        assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_wake_addr_maps_unspecified() {
        let v4: SocketAddr = "0.0.0.0:81".parse().unwrap();
        assert_eq!(wake_addr(v4), "127.0.0.1:81".parse().unwrap());
        let v6: SocketAddr = "[::]:82".parse().unwrap();
        assert_eq!(wake_addr(v6), "[::1]:82".parse().unwrap());
        let fixed: SocketAddr = "10.0.0.1:83".parse().unwrap();
        assert_eq!(wake_addr(fixed), fixed);
    }
}
