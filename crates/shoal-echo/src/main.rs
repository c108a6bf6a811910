//! Echo server example: every text message is sent straight back.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use shoal_server::{ServerConfig, ServerResult, ShutdownSignal, WsConn, WsHandler, WsServer};

#[derive(Parser, Debug)]
#[command(name = "shoal-echo", about = "WebSocket echo server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Seconds between keepalive pings.
    #[arg(long, default_value_t = 15)]
    keepalive_secs: u64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

struct EchoHandler;

#[async_trait]
impl WsHandler for EchoHandler {
    async fn on_connect(&self, conn: &WsConn) {
        info!(conn = conn.id(), "client connected");
    }

    async fn on_message(&self, conn: &WsConn, text: String) {
        info!(conn = conn.id(), len = text.len(), "echoing message");
        if let Err(e) = conn.send(&text).await {
            warn!(conn = conn.id(), error = %e, "echo send failed");
        }
    }

    async fn on_error(&self, err: &shoal_server::ProtocolError) {
        warn!(error = %err, "connection error");
    }

    async fn on_close(&self, conn: &WsConn) {
        info!(conn = conn.id(), "client disconnected");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.debug {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ServerResult<()> {
    let config = ServerConfig::new(cli.bind)
        .with_keepalive_interval(Duration::from_secs(cli.keepalive_secs));

    let server = WsServer::bind(config).await?;

    let shutdown = ShutdownSignal::new();
    shutdown.spawn_listener();

    server
        .run_until_shutdown(Arc::new(EchoHandler), shutdown.handle().wait())
        .await
}
