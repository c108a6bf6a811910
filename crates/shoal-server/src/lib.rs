//! WebSocket server: upgrade negotiation, connection lifecycle, keepalive.
//!
//! This crate owns everything stateful about a WebSocket connection:
//! - TCP accept loop with bounded concurrency
//! - HTTP upgrade negotiation (validation, 101/400 responses)
//! - per-connection read loop dispatching to a [`WsHandler`]
//! - keepalive pings every 15 seconds (configurable)
//! - graceful teardown with exactly-once `on_close`
//!
//! The wire format itself lives in `shoal-protocol`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shoal_server::{ServerConfig, WsConn, WsHandler, WsServer};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl WsHandler for Echo {
//!     async fn on_message(&self, conn: &WsConn, text: String) {
//!         let _ = conn.send(&text).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = WsServer::bind(ServerConfig::default()).await?;
//!     server.run(Arc::new(Echo)).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod handler;
mod listener;
mod signals;

pub use config::ServerConfig;
pub use connection::WsConn;
pub use error::{ServerError, ServerResult};
pub use handler::WsHandler;
pub use listener::{WsServer, upgrade};
pub use signals::{ShutdownHandle, ShutdownSignal};

// Handler implementors need the protocol error type for `on_error`.
pub use shoal_protocol::ProtocolError;
