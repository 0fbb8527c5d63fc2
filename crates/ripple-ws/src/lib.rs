//! Blocking RFC 6455 WebSocket server.
//!
//! Accepts TCP (optionally TLS) connections, performs the HTTP upgrade
//! handshake, and runs one thread per connection that turns the frame
//! stream into handler callbacks. Handlers answer through a [`Client`].
//!
//! - **Frame codec** (`frame`): frame parsing and writing with XOR masking
//! - **Assembler** (`assembler`): continuation merging, interleaved control frames
//! - **Handshake** (`handshake`): request parsing, Sec-WebSocket-Accept, HTTP responses
//! - **Close** (`close`): close payloads and close-code validation
//! - **Connection** (`connection`): the per-connection state machine
//! - **Server** (`server`): registration, accept loop, stop

pub mod assembler;
pub mod close;
mod connection;
pub mod error;
pub mod executor;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod options;
pub mod payload;
pub mod server;
pub mod stream;
pub mod tls;
pub mod writer;

pub use close::{CloseCode, CloseData};
pub use error::{Closure, ClosureKind, HandshakeError, ServerError, TlsError, WsError};
pub use frame::{Frame, Opcode};
pub use handler::{Client, FallbackHandler, HttpConnection, WebSocketHandler};
pub use handshake::{compute_accept_key, Headers, SERVER_NAME, SERVER_VERSION};
pub use options::{FileConfig, Options, OptionsBuilder};
pub use server::Server;
pub use tls::load_server_config;

/// Run `f` with `dispatch` as the thread's default subscriber, if given.
pub(crate) fn with_dispatch<T>(dispatch: Option<&tracing::Dispatch>, f: impl FnOnce() -> T) -> T {
    match dispatch {
        Some(d) => tracing::dispatcher::with_default(d, f),
        None => f(),
    }
}
