//! Echo server for the ripple WebSocket engine.
//!
//! Every text and binary message received on the endpoint is sent back
//! unchanged. Useful for interoperability runs and manual testing:
//!
//! - `ripple-echo --port 9001` - plain WebSocket on all interfaces
//! - `ripple-echo --config echo.toml` - settings from a TOML file
//! - `ripple-echo --cert cert.pem --key key.pem` - TLS (wss://)
//!
//! Log verbosity comes from `RUST_LOG`, falling back to `--log-level`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ripple_ws::{load_server_config, Client, FileConfig, Options, Server, WsError};

#[derive(Parser)]
#[command(name = "ripple-echo", version, about = "WebSocket echo server")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "9001", conflicts_with = "config")]
    port: u16,

    /// Address to bind (defaults to all interfaces)
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Listen queue length
    #[arg(long)]
    backlog: Option<u32>,

    /// Split outgoing messages into frames of at most this many bytes (0 = never)
    #[arg(long = "max-frame-size")]
    max_frame_size: Option<usize>,

    /// Number of threads running handler callbacks
    #[arg(long = "handler-threads")]
    handler_threads: Option<usize>,

    /// Read settings from a TOML file; other flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PEM certificate chain for TLS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key for TLS
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Request path the echo handler is registered at
    #[arg(long, default_value = "/")]
    endpoint: String,

    /// Log filter used when RUST_LOG is not set
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[derive(Default)]
struct Echo {
    client: Option<Client>,
}

impl ripple_ws::WebSocketHandler for Echo {
    fn on_opened(&mut self, client: Client) {
        info!(
            peer = ?client.peer_addr(),
            user_agent = client.user_agent().unwrap_or("-"),
            "client connected"
        );
        self.client = Some(client);
    }

    fn on_closed_by_client(&mut self, code: u16, reason: Option<String>) {
        info!(code, reason = reason.as_deref().unwrap_or(""), "client closed");
    }

    fn on_closed_by_server(&mut self, code: u16, reason: String) {
        info!(code, reason = %reason, "closed by server");
    }

    fn on_failure(&mut self, error: WsError) {
        warn!(error = %error, "connection failed");
    }

    fn on_text_message(&mut self, text: String) {
        if let Some(client) = &self.client {
            if let Err(e) = client.send_text_message(&text) {
                warn!(error = %e, "echo failed");
            }
        }
    }

    fn on_binary_data(&mut self, data: Vec<u8>) {
        if let Some(client) = &self.client {
            if let Err(e) = client.send_binary_data(&data) {
                warn!(error = %e, "echo failed");
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ripple_ws::ServerError> {
    let mut builder = match &cli.config {
        Some(path) => FileConfig::from_file(path)?.into_builder()?,
        None => Options::builder(cli.port),
    };
    if let Some(bind) = cli.bind {
        builder = builder.bind_address(bind);
    }
    if let Some(backlog) = cli.backlog {
        builder = builder.backlog(backlog);
    }
    if let Some(size) = cli.max_frame_size {
        builder = builder.max_frame_size(size);
    }
    if let Some(threads) = cli.handler_threads {
        builder = builder.handler_threads(threads);
    }
    if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
        builder = builder.tls(load_server_config(cert, key)?);
    }

    let mut server = Server::new(builder.build()?);
    server.add_handler_factory(cli.endpoint.clone(), || Some(Echo::default()))?;
    let addr = server.start()?;
    info!(addr = %addr, endpoint = %cli.endpoint, "echo server ready");

    server.join();
    Ok(())
}
