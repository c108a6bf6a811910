//! Application callback interface.
//!
//! A [`WsHandler`] is the only boundary between the server core and
//! application logic. The server guarantees, per connection:
//!
//! - exactly one `on_connect`, before any other callback;
//! - zero or more `on_message`, one per decoded text frame, awaited
//!   in arrival order (never concurrently for one connection);
//! - at most one `on_error`, immediately before the loop terminates;
//! - exactly one `on_close`, always last, on every termination path.

use async_trait::async_trait;

use shoal_protocol::ProtocolError;

use crate::connection::WsConn;

/// Application callbacks invoked by the connection loop.
///
/// All methods default to no-ops, so handlers implement only the
/// events they care about. Callbacks run on the connection's read
/// task: a slow callback stalls further reads on that connection
/// only, never on other connections.
#[async_trait]
pub trait WsHandler: Send + Sync {
    /// Called once when a connection completes the upgrade handshake.
    async fn on_connect(&self, conn: &WsConn) {
        let _ = conn;
    }

    /// Called for each decoded text frame.
    async fn on_message(&self, conn: &WsConn, text: String) {
        let _ = (conn, text);
    }

    /// Called once when the read loop hits a decode or stream error.
    async fn on_error(&self, err: &ProtocolError) {
        let _ = err;
    }

    /// Called once after the stream is closed, on every termination
    /// path. The natural place to release per-connection resources.
    async fn on_close(&self, conn: &WsConn) {
        let _ = conn;
    }
}
