//! TCP listener and upgrade negotiation.
//!
//! The listener plays the inbound-transport role: it accepts TCP
//! connections, reads the HTTP upgrade request head, and either
//! rejects with a 400-class response or writes the `101 Switching
//! Protocols` response and promotes the stream to a connection loop.
//! [`upgrade`] is exported separately for embedders that bring their
//! own accept loop and hand over a hijacked duplex stream.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shoal_protocol::{HandshakeError, UpgradeRequest, accept_response};

use crate::config::ServerConfig;
use crate::connection::{WsConn, serve_connection};
use crate::error::{ServerError, ServerResult};
use crate::handler::WsHandler;

/// WebSocket server bound to a TCP address.
pub struct WsServer {
    /// Server configuration.
    config: ServerConfig,
    /// TCP listener.
    listener: TcpListener,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
}

impl WsServer {
    /// Binds a new server to the address in the configuration.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "server listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    /// Returns the bound address (useful with port 0).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop, upgrading each connection and dispatching
    /// to the handler.
    ///
    /// Runs indefinitely; accept and upgrade failures are logged and
    /// the loop continues. Each connection holds a semaphore permit
    /// for its whole lifetime.
    pub async fn run(&self, handler: Arc<dyn WsHandler>) -> ServerResult<()> {
        loop {
            let permit = self.connection_semaphore.clone().acquire_owned().await;
            let permit = permit.expect("semaphore should not be closed");

            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted TCP connection");
                    let handler = handler.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        match upgrade(stream, handler, &config).await {
                            Ok((_conn, task)) => {
                                let _ = task.await;
                            }
                            Err(e) => {
                                debug!(peer = %addr, error = %e, "upgrade rejected");
                            }
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    // Continue accepting despite errors
                }
            }
        }
    }

    /// Runs the accept loop until the shutdown future completes.
    pub async fn run_until_shutdown<S>(
        &self,
        handler: Arc<dyn WsHandler>,
        shutdown: S,
    ) -> ServerResult<()>
    where
        S: std::future::Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

/// Upgrades one duplex stream to a WebSocket connection.
///
/// Reads and validates the HTTP upgrade head. On rejection a
/// 400-class response is written and no handler callback fires. On
/// success the literal 101 response is written, `on_connect` fires,
/// and the connection loop is spawned; bytes the client pipelined
/// after the head are replayed in front of the stream.
///
/// Returns the connection handle and the connection task handle,
/// which completes once `on_close` has fired.
pub async fn upgrade<S>(
    stream: S,
    handler: Arc<dyn WsHandler>,
    config: &ServerConfig,
) -> ServerResult<(WsConn, JoinHandle<()>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (head, leftover) = match read_request_head(&mut reader, config.max_request_head).await {
        Ok(parts) => parts,
        Err(e) => {
            reject(&mut writer, &e.to_string()).await;
            return Err(e);
        }
    };

    let request = match UpgradeRequest::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            reject(&mut writer, &e.to_string()).await;
            return Err(e.into());
        }
    };

    let key = match request.validate() {
        Ok(key) => key,
        Err(e) => {
            warn!(path = %request.path, error = %e, "invalid upgrade request");
            reject(&mut writer, &e.to_string()).await;
            return Err(e.into());
        }
    };

    // From here on the stream is ours; a failed response write aborts
    // silently, with no handler callback.
    if let Err(e) = writer.write_all(accept_response(key).as_bytes()).await {
        debug!(error = %e, "failed to write handshake response");
        let _ = writer.shutdown().await;
        return Err(e.into());
    }

    debug!(path = %request.path, "handshake complete");

    let reader = Cursor::new(leftover).chain(reader);
    Ok(serve_connection(reader, writer, handler, config).await)
}

/// Reads the request head up to the blank line, capped at `max` bytes.
///
/// Returns the head (without the terminator) and any bytes read past
/// it, which belong to the frame stream.
async fn read_request_head<R>(reader: &mut R, max: usize) -> ServerResult<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            buf.truncate(pos);
            return Ok((buf, leftover));
        }

        if buf.len() > max {
            return Err(ServerError::RequestHeadTooLarge { max });
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::MalformedRequest(
                "connection closed before end of request head".into(),
            )
            .into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Writes a 400 rejection with the reason as body. Best-effort: the
/// connection is being dropped either way.
async fn reject<W>(writer: &mut W, reason: &str)
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        reason.len(),
        reason
    );
    let _ = writer.write_all(response.as_bytes()).await;
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_protocol::{Opcode, ProtocolError, compute_accept_key, encode_frame_masked};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::TcpStream;

    const KEY: [u8; 4] = [1, 2, 3, 4];
    const SAMPLE_NONCE: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_head(extra: &str) -> String {
        format!(
            "GET /ws HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {SAMPLE_NONCE}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n{extra}"
        )
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl WsHandler for Recorder {
        async fn on_connect(&self, _conn: &WsConn) {
            self.events.lock().unwrap().push("connect".into());
        }
        async fn on_message(&self, _conn: &WsConn, text: String) {
            self.events.lock().unwrap().push(format!("message:{text}"));
        }
        async fn on_error(&self, _err: &ProtocolError) {
            self.events.lock().unwrap().push("error".into());
        }
        async fn on_close(&self, _conn: &WsConn) {
            self.events.lock().unwrap().push("close".into());
        }
    }

    fn quiet_config() -> ServerConfig {
        ServerConfig::default().with_keepalive_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn upgrade_writes_literal_101_response() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let handler = Arc::new(Recorder::default());
        let config = quiet_config();

        client
            .write_all(upgrade_head("").as_bytes())
            .await
            .unwrap();
        let (_conn, task) = upgrade(server, handler.clone() as Arc<dyn WsHandler>, &config)
            .await
            .unwrap();

        let expected = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(SAMPLE_NONCE)
        );
        let mut response = vec![0u8; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, expected.as_bytes());

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_upgrade_fires_no_callbacks() {
        let (mut client, server) = tokio::io::duplex(8 * 1024);
        let handler = Arc::new(Recorder::default());
        let config = quiet_config();

        client
            .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let result = upgrade(server, handler.clone() as Arc<dyn WsHandler>, &config).await;
        assert!(matches!(
            result,
            Err(ServerError::Handshake(HandshakeError::InvalidUpgrade))
        ));

        let mut response = [0u8; 24];
        client.read_exact(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request"));

        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let handler = Arc::new(Recorder::default());
        let config = quiet_config().with_max_request_head(128);

        let huge = format!("GET /ws HTTP/1.1\r\nX-Filler: {}\r\n", "x".repeat(512));
        client.write_all(huge.as_bytes()).await.unwrap();

        let result = upgrade(server, handler.clone() as Arc<dyn WsHandler>, &config).await;
        assert!(matches!(
            result,
            Err(ServerError::RequestHeadTooLarge { max: 128 })
        ));
        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn pipelined_frame_after_head_is_not_lost() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let handler = Arc::new(Recorder::default());
        let config = quiet_config();

        // Head and first frame arrive in a single write.
        let mut bytes = upgrade_head("").into_bytes();
        bytes.extend(encode_frame_masked(Opcode::Text, b"early", KEY));
        client.write_all(&bytes).await.unwrap();

        let (_conn, task) = upgrade(server, handler.clone() as Arc<dyn WsHandler>, &config)
            .await
            .unwrap();
        drop(client);
        task.await.unwrap();

        assert_eq!(
            handler.events(),
            vec!["connect", "message:early", "error", "close"]
        );
    }

    #[tokio::test]
    async fn tcp_end_to_end_roundtrip() {
        let config = ServerConfig::new(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_keepalive_interval(Duration::from_secs(3600));
        let server = Arc::new(WsServer::bind(config).await.unwrap());
        let addr = server.local_addr().unwrap();
        let handler = Arc::new(Recorder::default());

        let accept_server = server.clone();
        let accept_handler = handler.clone();
        tokio::spawn(async move {
            let _ = accept_server.run(accept_handler as Arc<dyn WsHandler>).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(upgrade_head("").as_bytes())
            .await
            .unwrap();

        // Read up to the end of the response head.
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(response.contains(&compute_accept_key(SAMPLE_NONCE)));

        client
            .write_all(&encode_frame_masked(Opcode::Text, b"over tcp", KEY))
            .await
            .unwrap();
        client
            .write_all(&encode_frame_masked(Opcode::Close, &[], KEY))
            .await
            .unwrap();

        // Close echo marks the end of the connection.
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x88);

        // Teardown finishes shortly after the close echo; poll for it.
        for _ in 0..100 {
            if handler.events().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            handler.events(),
            vec!["connect", "message:over tcp", "close"]
        );
    }
}
