//! Server options: a validating builder and a TOML file form.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use serde::Deserialize;

use crate::error::ServerError;
use crate::frame::MAX_CONTROL_PAYLOAD;
use crate::tls::load_server_config;

/// Smallest accepted maximum frame size; anything lower would fragment
/// payloads that fit in the 7-bit length form.
pub const MIN_MAX_FRAME_SIZE: usize = MAX_CONTROL_PAYLOAD + 1;

/// Immutable server configuration. Build with [`Options::builder`].
#[derive(Debug, Clone)]
pub struct Options {
    port: u16,
    backlog: Option<u32>,
    bind_address: Option<IpAddr>,
    max_frame_size: Option<usize>,
    tls: Option<Arc<ServerConfig>>,
    dispatch: Option<tracing::Dispatch>,
    handler_threads: usize,
}

impl Options {
    /// Start building options for `port`. Port 0 binds an ephemeral port.
    pub fn builder(port: u16) -> OptionsBuilder {
        OptionsBuilder {
            port,
            backlog: None,
            bind_address: None,
            max_frame_size: None,
            tls: None,
            dispatch: None,
            handler_threads: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn backlog(&self) -> Option<u32> {
        self.backlog
    }

    pub fn bind_address(&self) -> Option<IpAddr> {
        self.bind_address
    }

    /// The address to listen on; all interfaces when no bind address is set.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }

    /// Maximum outgoing frame payload; 0 means messages are never fragmented.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(0)
    }

    pub fn tls(&self) -> Option<&Arc<ServerConfig>> {
        self.tls.as_ref()
    }

    pub fn dispatch(&self) -> Option<&tracing::Dispatch> {
        self.dispatch.as_ref()
    }

    pub fn handler_threads(&self) -> usize {
        self.handler_threads
    }
}

#[derive(Debug, Clone)]
pub struct OptionsBuilder {
    port: u16,
    backlog: Option<u32>,
    bind_address: Option<IpAddr>,
    max_frame_size: Option<usize>,
    tls: Option<Arc<ServerConfig>>,
    dispatch: Option<tracing::Dispatch>,
    handler_threads: Option<usize>,
}

impl OptionsBuilder {
    /// Listen queue length handed to `listen(2)`. Must be positive.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Split outgoing text and binary messages into frames of at most
    /// `size` bytes. Must be 0 (no limit) or at least 126.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    pub fn tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Route this server's log events to `dispatch` instead of the global
    /// subscriber.
    pub fn dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Number of threads running handler callbacks.
    pub fn handler_threads(mut self, threads: usize) -> Self {
        self.handler_threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<Options, ServerError> {
        if self.backlog == Some(0) {
            return Err(ServerError::InvalidOption(
                "backlog must be greater than 0".to_string(),
            ));
        }
        if let Some(size) = self.max_frame_size {
            if size != 0 && size < MIN_MAX_FRAME_SIZE {
                return Err(ServerError::InvalidOption(format!(
                    "max frame size must be at least {} (got {})",
                    MIN_MAX_FRAME_SIZE, size
                )));
            }
        }
        let handler_threads = match self.handler_threads {
            Some(0) => {
                return Err(ServerError::InvalidOption(
                    "handler threads must be greater than 0".to_string(),
                ))
            }
            Some(n) => n,
            None => std::thread::available_parallelism().map_or(4, |n| n.get()),
        };

        Ok(Options {
            port: self.port,
            backlog: self.backlog,
            bind_address: self.bind_address,
            max_frame_size: self.max_frame_size,
            tls: self.tls,
            dispatch: self.dispatch,
            handler_threads,
        })
    }
}

/// Server options as read from a TOML file.
///
/// ```toml
/// port = 9001
/// backlog = 128
/// bind_address = "127.0.0.1"
/// max_frame_size = 16384
/// handler_threads = 4
///
/// [tls]
/// cert_file = "cert.pem"
/// key_file = "key.pem"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: u16,
    #[serde(default)]
    pub backlog: Option<u32>,
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    #[serde(default)]
    pub max_frame_size: Option<usize>,
    #[serde(default)]
    pub handler_threads: Option<usize>,
    #[serde(default)]
    pub tls: Option<TlsFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFileConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<FileConfig, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<FileConfig, ServerError> {
        toml::from_str(content)
            .map_err(|e| ServerError::Config(format!("failed to parse config: {}", e)))
    }

    /// Turn the file settings into a builder, loading TLS material if
    /// configured. Callers can still override fields before `build()`.
    pub fn into_builder(self) -> Result<OptionsBuilder, ServerError> {
        let mut builder = Options::builder(self.port);
        if let Some(backlog) = self.backlog {
            builder = builder.backlog(backlog);
        }
        if let Some(address) = self.bind_address {
            builder = builder.bind_address(address);
        }
        if let Some(size) = self.max_frame_size {
            builder = builder.max_frame_size(size);
        }
        if let Some(threads) = self.handler_threads {
            builder = builder.handler_threads(threads);
        }
        if let Some(tls) = self.tls {
            builder = builder.tls(load_server_config(&tls.cert_file, &tls.key_file)?);
        }
        Ok(builder)
    }
}
