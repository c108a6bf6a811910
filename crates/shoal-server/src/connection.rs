//! Connection lifecycle: read loop, keepalive, teardown.
//!
//! Each upgraded connection is driven by two tasks sharing one
//! stream: the read task decodes frames and dispatches callbacks, the
//! keepalive task emits periodic pings. Both observe a shared close
//! signal; both have stopped before the stream is shut down and
//! `on_close` fires.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use shoal_protocol::{
    Frame, FrameHeader, Opcode, ProtocolError, ProtocolResult, apply_mask, encode_frame,
};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::WsHandler;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to one upgraded connection.
///
/// Cheap to clone; every clone refers to the same connection. The
/// write half sits behind a lock so application sends and keepalive
/// pings never interleave at the byte level.
#[derive(Clone)]
pub struct WsConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: u64,
    writer: Mutex<BoxedWriter>,
    close_tx: watch::Sender<bool>,
    close_requested: AtomicBool,
}

impl WsConn {
    fn new(writer: BoxedWriter) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnInner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                writer: Mutex::new(writer),
                close_tx,
                close_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier for this connection, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Sends a text frame to the client.
    ///
    /// Safe to call concurrently with the read loop and from within
    /// handler callbacks. Fails if the connection is already closing
    /// or the underlying write fails.
    pub async fn send(&self, text: &str) -> ServerResult<()> {
        if self.inner.close_requested.load(Ordering::SeqCst) {
            return Err(ServerError::ConnectionClosed);
        }
        self.write_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Requests connection close.
    ///
    /// Idempotent: the first call signals the read and keepalive tasks
    /// to stop, later calls are no-ops. `on_close` still fires exactly
    /// once, from the connection task after the stream is closed.
    pub fn close(&self) {
        if !self.inner.close_requested.swap(true, Ordering::SeqCst) {
            trace!(conn = self.id(), "close requested");
            let _ = self.inner.close_tx.send(true);
        }
    }

    pub(crate) async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> ServerResult<()> {
        let bytes = encode_frame(opcode, payload);
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.inner.close_tx.subscribe()
    }

    async fn shutdown_stream(&self) {
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!(conn = self.id(), error = %e, "stream shutdown failed");
        }
    }
}

impl fmt::Debug for WsConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConn").field("id", &self.inner.id).finish()
    }
}

/// Reads one client frame off the stream.
///
/// Async twin of the protocol crate's [`shoal_protocol::FrameReader`]:
/// same header logic, driven by `read_exact` sequencing. The payload
/// cap is checked before the payload buffer is allocated.
pub(crate) async fn read_frame<R>(reader: &mut R, max_payload: u64) -> ProtocolResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;
    let header = FrameHeader::parse(header[0], header[1])?;

    let mut ext = [0u8; 8];
    let ext = &mut ext[..header.extended_len_bytes()];
    reader.read_exact(ext).await?;

    let len = header.payload_len(ext);
    if len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }

    let mut key = [0u8; 4];
    reader.read_exact(&mut key).await?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    apply_mask(&mut payload, key);

    Ok(Frame {
        fin: header.fin,
        opcode: header.opcode,
        payload,
    })
}

/// Fires `on_connect`, then spawns the connection task.
///
/// Returns the connection handle and the task handle; the task
/// completes once `on_close` has fired. Does not block the caller
/// beyond the `on_connect` callback itself.
pub(crate) async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    handler: Arc<dyn WsHandler>,
    config: &ServerConfig,
) -> (WsConn, JoinHandle<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let conn = WsConn::new(Box::new(writer));
    debug!(conn = conn.id(), "connection established");
    handler.on_connect(&conn).await;

    let task_conn = conn.clone();
    let max_payload = config.max_payload;
    let keepalive_interval = config.keepalive_interval;

    // Subscribe before handing the handle out: a close() issued
    // before the task runs must still wake both loops.
    let mut close_rx = conn.close_signal();
    let keepalive_close_rx = conn.close_signal();

    let handle = tokio::spawn(async move {
        let conn = task_conn;
        let mut reader = reader;

        let keepalive = tokio::spawn(keepalive_loop(
            conn.clone(),
            keepalive_interval,
            keepalive_close_rx,
        ));
        read_loop(&mut reader, &conn, &handler, max_payload, &mut close_rx).await;

        // Stop the keepalive task and join it before touching the
        // stream; both activities must be done before the close.
        conn.close();
        let _ = keepalive.await;

        conn.shutdown_stream().await;
        handler.on_close(&conn).await;
        debug!(conn = conn.id(), "connection closed");
    });

    (conn, handle)
}

async fn read_loop<R>(
    reader: &mut R,
    conn: &WsConn,
    handler: &Arc<dyn WsHandler>,
    max_payload: u64,
    close_rx: &mut watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            result = read_frame(reader, max_payload) => match result {
                Ok(frame) => {
                    if !dispatch_frame(frame, conn, handler).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(conn = conn.id(), error = %e, "read failed");
                    handler.on_error(&e).await;
                    return;
                }
            },
            _ = close_rx.changed() => {
                trace!(conn = conn.id(), "read loop observed close signal");
                return;
            }
        }
    }
}

/// Dispatches one decoded frame. Returns false when the loop should
/// terminate.
async fn dispatch_frame(frame: Frame, conn: &WsConn, handler: &Arc<dyn WsHandler>) -> bool {
    match frame.opcode {
        Opcode::Text => match frame.into_text() {
            Ok(text) => {
                handler.on_message(conn, text).await;
                true
            }
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "invalid text frame");
                handler.on_error(&e).await;
                false
            }
        },
        Opcode::Binary => {
            // Only text reaches the application in this protocol.
            debug!(
                conn = conn.id(),
                len = frame.payload.len(),
                "dropping binary frame"
            );
            true
        }
        Opcode::Ping => {
            // Pong echoes the ping payload; best-effort.
            if let Err(e) = conn.write_frame(Opcode::Pong, &frame.payload).await {
                debug!(conn = conn.id(), error = %e, "pong reply failed");
            }
            true
        }
        Opcode::Pong => {
            trace!(conn = conn.id(), "keepalive ack");
            true
        }
        Opcode::Close => {
            // Close handshake: echo the close frame, then terminate
            // cleanly (no on_error).
            debug!(conn = conn.id(), "close frame received");
            if let Err(e) = conn.write_frame(Opcode::Close, &frame.payload).await {
                trace!(conn = conn.id(), error = %e, "close reply failed");
            }
            false
        }
        // Rejected during header parse; kept for exhaustiveness.
        Opcode::Continuation => false,
    }
}

async fn keepalive_loop(conn: WsConn, interval: Duration, mut close_rx: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Best-effort: a failed ping is not reported to the
                // handler, the read side surfaces the broken stream.
                if let Err(e) = conn.write_frame(Opcode::Ping, &[]).await {
                    debug!(conn = conn.id(), error = %e, "keepalive ping failed");
                }
            }
            _ = close_rx.changed() => break,
        }
    }

    trace!(conn = conn.id(), "keepalive stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_protocol::encode_frame_masked;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;

    const KEY: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];

    /// Handler that records the callback sequence.
    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    #[async_trait::async_trait]
    impl WsHandler for Recorder {
        async fn on_connect(&self, _conn: &WsConn) {
            self.push("connect");
        }
        async fn on_message(&self, _conn: &WsConn, text: String) {
            self.push(format!("message:{text}"));
        }
        async fn on_error(&self, _err: &ProtocolError) {
            self.push("error");
        }
        async fn on_close(&self, _conn: &WsConn) {
            self.push("close");
        }
    }

    fn quiet_config() -> ServerConfig {
        // Keepalive far in the future so pings don't show up in
        // client-side reads.
        ServerConfig::default().with_keepalive_interval(Duration::from_secs(3600))
    }

    async fn spawn(
        config: &ServerConfig,
    ) -> (DuplexStream, Arc<Recorder>, WsConn, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let handler = Arc::new(Recorder::default());
        let (reader, writer) = tokio::io::split(server);
        let (conn, handle) =
            serve_connection(reader, writer, handler.clone() as Arc<dyn WsHandler>, config).await;
        (client, handler, conn, handle)
    }

    async fn send_text(client: &mut DuplexStream, text: &str) {
        let bytes = encode_frame_masked(Opcode::Text, text.as_bytes(), KEY);
        client.write_all(&bytes).await.unwrap();
    }

    /// Reads one short unmasked server frame from the client side.
    async fn recv_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");
        let len = (header[1] & 0x7F) as usize;
        assert!(len < 126, "helper only handles short frames");
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (header[0], payload)
    }

    #[tokio::test]
    async fn lifecycle_ordering_on_stream_close() {
        let config = quiet_config();
        let (mut client, handler, _conn, handle) = spawn(&config).await;

        send_text(&mut client, "first").await;
        send_text(&mut client, "second").await;
        send_text(&mut client, "third").await;
        drop(client);

        handle.await.unwrap();
        assert_eq!(
            handler.events(),
            vec![
                "connect",
                "message:first",
                "message:second",
                "message:third",
                "error",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn close_frame_terminates_without_error() {
        let config = quiet_config();
        let (mut client, handler, _conn, handle) = spawn(&config).await;

        send_text(&mut client, "hello").await;
        let bytes = encode_frame_masked(Opcode::Close, &[], KEY);
        client.write_all(&bytes).await.unwrap();

        // The close frame is echoed back before teardown.
        let (b0, payload) = recv_frame(&mut client).await;
        assert_eq!(b0, 0x88);
        assert!(payload.is_empty());

        handle.await.unwrap();
        assert_eq!(handler.events(), vec!["connect", "message:hello", "close"]);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let config = quiet_config();
        let (mut client, handler, _conn, handle) = spawn(&config).await;

        let bytes = encode_frame_masked(Opcode::Ping, b"probe", KEY);
        client.write_all(&bytes).await.unwrap();

        let (b0, payload) = recv_frame(&mut client).await;
        assert_eq!(b0, 0x8A);
        assert_eq!(payload, b"probe");

        drop(client);
        handle.await.unwrap();
        // Pings never reach on_message.
        assert_eq!(handler.events(), vec!["connect", "error", "close"]);
    }

    #[tokio::test]
    async fn unmasked_frame_fires_on_error() {
        let config = quiet_config();
        let (mut client, handler, _conn, handle) = spawn(&config).await;

        client.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        handle.await.unwrap();
        assert_eq!(handler.events(), vec!["connect", "error", "close"]);
    }

    #[tokio::test]
    async fn oversize_frame_fires_on_error() {
        let config = quiet_config().with_max_payload(8);
        let (mut client, handler, _conn, handle) = spawn(&config).await;

        send_text(&mut client, "way past the eight byte cap").await;

        handle.await.unwrap();
        assert_eq!(handler.events(), vec!["connect", "error", "close"]);
    }

    #[tokio::test]
    async fn explicit_close_is_idempotent() {
        let config = quiet_config();
        let (_client, handler, conn, handle) = spawn(&config).await;

        conn.close();
        conn.close();

        handle.await.unwrap();
        // No on_error: consumer close is a clean termination.
        assert_eq!(handler.events(), vec!["connect", "close"]);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let config = quiet_config();
        let (_client, _handler, conn, handle) = spawn(&config).await;

        conn.close();
        handle.await.unwrap();

        let result = conn.send("too late").await;
        assert!(matches!(result, Err(ServerError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn send_reaches_client_as_text_frame() {
        let config = quiet_config();
        let (mut client, _handler, conn, handle) = spawn(&config).await;

        conn.send("pushed").await.unwrap();

        let (b0, payload) = recv_frame(&mut client).await;
        assert_eq!(b0, 0x81);
        assert_eq!(payload, b"pushed");

        drop(client);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ping_on_the_wire() {
        // Default 15s interval; paused time fast-forwards to the tick.
        let config = ServerConfig::default();
        let (mut client, _handler, _conn, handle) = spawn(&config).await;

        let (b0, payload) = recv_frame(&mut client).await;
        assert_eq!(b0, 0x89);
        assert!(payload.is_empty());

        drop(client);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn two_connections_do_not_interfere() {
        let config = quiet_config();
        let (mut client_a, handler_a, _conn_a, handle_a) = spawn(&config).await;
        let (mut client_b, handler_b, _conn_b, handle_b) = spawn(&config).await;

        send_text(&mut client_a, "a1").await;
        send_text(&mut client_b, "b1").await;
        send_text(&mut client_a, "a2").await;
        drop(client_a);
        drop(client_b);

        handle_a.await.unwrap();
        handle_b.await.unwrap();

        assert_eq!(
            handler_a.events(),
            vec!["connect", "message:a1", "message:a2", "error", "close"]
        );
        assert_eq!(
            handler_b.events(),
            vec!["connect", "message:b1", "error", "close"]
        );
    }

    #[tokio::test]
    async fn binary_frames_are_dropped() {
        let config = quiet_config();
        let (mut client, handler, _conn, handle) = spawn(&config).await;

        let bytes = encode_frame_masked(Opcode::Binary, &[1, 2, 3], KEY);
        client.write_all(&bytes).await.unwrap();
        send_text(&mut client, "after").await;
        drop(client);

        handle.await.unwrap();
        assert_eq!(
            handler.events(),
            vec!["connect", "message:after", "error", "close"]
        );
    }
}
