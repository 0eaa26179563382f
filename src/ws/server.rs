//! The WebSocket server: accept loop, per-connection drivers, heartbeat,
//! broadcast, graceful shutdown.
//!
//! Each accepted socket gets a driver task that performs every read and
//! write for that connection: it runs the handshake, then races socket
//! reads against the send-queue signal, draining one queued buffer per
//! wake. Application callbacks execute on the driver, so a slow callback
//! stalls its own connection, nothing else. The heartbeat runs as a
//! separate task and touches connections only through their thread-safe
//! state; it is started after the accept loop.

use crate::{
    errors::ErrorKind,
    http::stream::find_bytes,
    limits::WsLimits,
    ws::{
        connection::{
            WebSocketConnection, WsCallbacks, WsError, CLOSE_ABNORMAL, CLOSE_GOING_AWAY,
            CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_LARGE,
        },
        handshake,
    },
    Request,
};
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long shutdown waits for drivers to drain before force-closing.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Read chunk for promoted (post-handshake) sockets.
const READ_CHUNK: usize = 8 * 1024;

struct ServerShared {
    limits: WsLimits,
    callbacks: WsCallbacks,
    connections: DashMap<Uuid, Arc<WebSocketConnection>>,
    running: AtomicBool,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

/// An RFC 6455 WebSocket server.
///
/// # Examples
///
/// ```no_run
/// use ember_web::WebSocketServer;
///
/// #[tokio::main]
/// async fn main() {
///     let mut server = WebSocketServer::builder()
///         .port(8081)
///         .on_message(|conn, msg| {
///             let _ = conn.send_text(&format!("echo: {msg}"));
///         })
///         .build();
///
///     server.start().await.unwrap();
///     tokio::signal::ctrl_c().await.unwrap();
///     server.shutdown().await;
/// }
/// ```
pub struct WebSocketServer {
    shared: Arc<ServerShared>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl WebSocketServer {
    /// Creates a new builder for configuring the server instance.
    pub fn builder() -> WebSocketServerBuilder {
        WebSocketServerBuilder {
            limits: WsLimits::default(),
            callbacks: WsCallbacks::default(),
        }
    }

    /// Binds the listener and spawns the accept loop, then the heartbeat
    /// (in that order: drivers must be running before the heartbeat).
    pub async fn start(&mut self) -> io::Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "WebSocket server is already running",
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.shared.limits.port)).await?;
        self.local_addr = Some(listener.local_addr()?);
        info!(addr = %self.local_addr.unwrap(), "WebSocket server started");

        let shared = self.shared.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, shared)));

        let shared = self.shared.clone();
        self.heartbeat_task = Some(tokio::spawn(heartbeat_loop(shared)));

        Ok(())
    }

    /// The bound address, available after [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Queues `message` on every open connection. Delivery is FIFO within
    /// a connection; a connection whose queue is full is skipped (and the
    /// skip logged), never the whole sweep.
    pub fn broadcast_text(&self, message: &str) {
        for entry in self.shared.connections.iter() {
            let conn = entry.value();
            if conn.is_connected() {
                if let Err(err) = conn.send_text(message) {
                    warn!(id = %conn.id(), error = %err, "broadcast skipped a connection");
                }
            }
        }
    }

    /// Binary counterpart of [`broadcast_text`](Self::broadcast_text).
    pub fn broadcast_binary(&self, data: &[u8]) {
        for entry in self.shared.connections.iter() {
            let conn = entry.value();
            if conn.is_connected() {
                if let Err(err) = conn.send_binary(data) {
                    warn!(id = %conn.id(), error = %err, "broadcast skipped a connection");
                }
            }
        }
    }

    /// Graceful shutdown: stop accepting, close every connection, wait up
    /// to 5 seconds for the drivers to drain, then force-close stragglers.
    /// The heartbeat observes the running flag and exits at its next wake.
    pub async fn shutdown(&mut self) {
        if self
            .shared
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(accept) = self.accept_task.take() {
            accept.abort();
        }

        for entry in self.shared.connections.iter() {
            entry.value().close(CLOSE_NORMAL, "Normal closure");
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while !self.shared.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let drivers = std::mem::take(&mut *self.shared.drivers.lock().unwrap());
        for driver in drivers {
            driver.abort();
        }
        self.shared.connections.clear();

        if let Some(heartbeat) = self.heartbeat_task.take() {
            heartbeat.abort();
        }

        info!("WebSocket server stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    while shared.running.load(Ordering::Acquire) {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "error accepting connection");
                continue;
            }
        };
        debug!(%addr, "new connection");

        let shared_for_task = shared.clone();
        let handle = tokio::spawn(async move {
            connection_driver(stream, addr, shared_for_task).await;
        });
        let mut drivers = shared.drivers.lock().unwrap();
        drivers.retain(|h| !h.is_finished());
        drivers.push(handle);
    }
}

/// Accumulates the HTTP upgrade request (bounded by `max_message_size`),
/// answers it, and on success runs the frame loop until the connection
/// reaches CLOSED.
async fn connection_driver(mut stream: TcpStream, addr: SocketAddr, shared: Arc<ServerShared>) {
    let (request, leftover) = match read_handshake(&mut stream, &shared.limits).await {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(%addr, error = %err, "handshake failed");
            if let ErrorKind::Io(_) = err {
                return;
            }
            let _ = stream.write_all(&err.to_response().to_bytes()).await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let response = handshake::handshake_response(&request);
    let upgraded = response.status_code() == 101;
    if stream.write_all(&response.to_bytes()).await.is_err() {
        return;
    }
    if !upgraded {
        let _ = stream.shutdown().await;
        return;
    }

    let conn = WebSocketConnection::new(addr.to_string(), shared.limits.send_queue_capacity);
    shared.connections.insert(conn.id(), conn.clone());
    (shared.callbacks.on_open)(&conn);
    info!(id = %conn.id(), %addr, "websocket handshake completed");

    let close_code = frame_loop(&mut stream, &conn, &shared, leftover).await;

    let _ = stream.shutdown().await;
    if conn.finish_close(close_code) {
        (shared.callbacks.on_close)(&conn, conn.close_code());
    }
    shared.connections.remove(&conn.id());
    debug!(id = %conn.id(), code = close_code, "websocket connection closed");
}

/// Reads and dispatches frames until the connection closes; returns the
/// close code to report.
async fn frame_loop(
    stream: &mut TcpStream,
    conn: &Arc<WebSocketConnection>,
    shared: &Arc<ServerShared>,
    mut pending: Vec<u8>,
) -> u16 {
    let (mut reader, mut writer) = stream.split();
    let mut chunk = vec![0u8; READ_CHUNK];

    // Frames pipelined behind the handshake bytes are handled first.
    if !pending.is_empty() {
        if let Err(err) = WebSocketConnection::handle_data(conn, &mut pending, &shared.callbacks) {
            (shared.callbacks.on_error)(conn, &err);
            conn.close(CLOSE_PROTOCOL_ERROR, "protocol error");
        }
    }

    loop {
        if !conn.is_connected() {
            return conn.close_code();
        }

        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    // Peer hung up without a close frame.
                    return conn.close_code();
                }
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    if pending.len() > shared.limits.max_message_size {
                        let err = WsError::Protocol("frame exceeds maximum size".to_string());
                        (shared.callbacks.on_error)(conn, &err);
                        conn.close(CLOSE_TOO_LARGE, "frame too large");
                        let _ = drain_queue(&mut writer, conn).await;
                        return CLOSE_TOO_LARGE;
                    }
                    match WebSocketConnection::handle_data(conn, &mut pending, &shared.callbacks) {
                        Ok(close_received) => {
                            if close_received {
                                // flush the echo (or the already-queued
                                // local close), then finish
                                if drain_queue(&mut writer, conn).await.is_err() {
                                    return CLOSE_ABNORMAL;
                                }
                                return conn.close_code();
                            }
                        }
                        Err(err) => {
                            (shared.callbacks.on_error)(conn, &err);
                            conn.close(CLOSE_PROTOCOL_ERROR, "protocol error");
                            let _ = drain_queue(&mut writer, conn).await;
                            return CLOSE_PROTOCOL_ERROR;
                        }
                    }
                }
                Err(err) => {
                    let transport = WsError::Transport(err.to_string());
                    (shared.callbacks.on_error)(conn, &transport);
                    return CLOSE_ABNORMAL;
                }
            },

            _ = conn.wait_writable() => {
                // One buffer per wake; re-arm when more is queued.
                if let Some(bytes) = conn.pop_send() {
                    if let Err(err) = writer.write_all(&bytes).await {
                        let transport = WsError::Transport(err.to_string());
                        (shared.callbacks.on_error)(conn, &transport);
                        return CLOSE_ABNORMAL;
                    }
                }
                if conn.has_pending() {
                    conn.notify_writable();
                } else if conn.is_closing() {
                    // local close fully flushed
                    return conn.close_code();
                }
            }
        }
    }
}

async fn drain_queue<W: AsyncWrite + Unpin>(
    writer: &mut W,
    conn: &Arc<WebSocketConnection>,
) -> io::Result<()> {
    while let Some(bytes) = conn.pop_send() {
        writer.write_all(&bytes).await?;
    }
    Ok(())
}

/// Accumulates bytes until the header terminator, capped at
/// `max_message_size`, and returns the parsed upgrade request plus any
/// bytes that followed the terminator.
async fn read_handshake(
    stream: &mut TcpStream,
    limits: &WsLimits,
) -> Result<(Request, Vec<u8>), ErrorKind> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let (head_end, term_len) = loop {
        let n = stream.read(&mut chunk).await.map_err(ErrorKind::Io)?;
        if n == 0 {
            return Err(ErrorKind::UnexpectedEof);
        }

        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        let crlf = find_bytes(&buf[scan_from..], b"\r\n\r\n").map(|i| (scan_from + i, 4));
        let lf = find_bytes(&buf[scan_from..], b"\n\n").map(|i| (scan_from + i, 2));
        if let Some(hit) = match (crlf, lf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        } {
            break hit;
        }

        if buf.len() > limits.max_message_size {
            return Err(ErrorKind::HeaderBlockTooLarge);
        }
    };

    let leftover = buf.split_off(head_end + term_len);
    buf.truncate(head_end);
    let request = handshake::parse_handshake_head(&buf)?;
    Ok((request, leftover))
}

async fn heartbeat_loop(shared: Arc<ServerShared>) {
    let mut ticker = tokio::time::interval(shared.limits.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    while shared.running.load(Ordering::Acquire) {
        ticker.tick().await;
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        for entry in shared.connections.iter() {
            let conn = entry.value();
            if !conn.is_connected() {
                continue;
            }

            if conn.inactivity() > shared.limits.max_inactivity_time {
                info!(id = %conn.id(), "closing inactive connection");
                conn.close(CLOSE_GOING_AWAY, "Inactivity timeout");
            } else {
                conn.ping();
            }
        }
    }
}

/// Builder for configuring and creating [`WebSocketServer`] instances.
///
/// The five callbacks default to no-ops; every limit carries the
/// [`WsLimits`] default.
pub struct WebSocketServerBuilder {
    limits: WsLimits,
    callbacks: WsCallbacks,
}

impl WebSocketServerBuilder {
    /// Port to bind (default `8081`).
    pub fn port(mut self, port: u16) -> Self {
        self.limits.port = port;
        self
    }

    /// Idle cutoff enforced by the heartbeat (default 5 minutes).
    pub fn max_inactivity_time(mut self, value: Duration) -> Self {
        assert!(!value.is_zero(), "Max inactivity time must be positive");
        self.limits.max_inactivity_time = value;
        self
    }

    /// Cap on the accumulated handshake request (default 16 MiB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "Max message size must be positive");
        self.limits.max_message_size = bytes;
        self
    }

    /// Heartbeat cadence (default 30 seconds).
    pub fn heartbeat_interval(mut self, value: Duration) -> Self {
        assert!(!value.is_zero(), "Heartbeat interval must be positive");
        self.limits.heartbeat_interval = value;
        self
    }

    /// Replaces the whole limit set at once.
    pub fn limits(mut self, limits: WsLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Called once per connection right after the 101 response.
    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocketConnection>) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Arc::new(callback);
        self
    }

    /// Called for every TEXT frame with its UTF-8 payload.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocketConnection>, String) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Arc::new(callback);
        self
    }

    /// Called for every BINARY frame with its own copy of the payload.
    pub fn on_binary_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocketConnection>, Vec<u8>) + Send + Sync + 'static,
    {
        self.callbacks.on_binary_message = Arc::new(callback);
        self
    }

    /// Called exactly once when a connection reaches CLOSED, with the close
    /// code.
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocketConnection>, u16) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Arc::new(callback);
        self
    }

    /// Called on protocol and transport errors, before the close.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocketConnection>, &WsError) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Arc::new(callback);
        self
    }

    pub fn build(self) -> WebSocketServer {
        WebSocketServer {
            shared: Arc::new(ServerShared {
                limits: self.limits,
                callbacks: self.callbacks,
                connections: DashMap::new(),
                running: AtomicBool::new(false),
                drivers: Mutex::new(Vec::new()),
            }),
            local_addr: None,
            accept_task: None,
            heartbeat_task: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frame::{Frame, Opcode};
    use std::sync::atomic::AtomicUsize;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_bytes() -> Vec<u8> {
        format!(
            "GET /chat HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
        .into_bytes()
    }

    async fn read_http_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while find_bytes(&head, b"\r\n\r\n").is_none() {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "eof before end of handshake response");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn read_exact_frame(stream: &mut TcpStream) -> Frame {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match Frame::parse(&buf) {
                Ok((frame, _)) => return frame,
                Err(_) => {
                    let n = stream.read(&mut byte).await.unwrap();
                    assert!(n > 0, "eof before complete frame");
                    buf.push(byte[0]);
                }
            }
        }
    }

    async fn started(builder: WebSocketServerBuilder) -> WebSocketServer {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("ember_web=debug")
            .try_init();
        let mut server = builder.port(0).build();
        server.start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn handshake_and_echo() {
        let server = started(WebSocketServer::builder().on_message(|conn, msg| {
            let _ = conn.send_text(&format!("echo: {msg}"));
        }))
        .await;

        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        client.write_all(&upgrade_bytes()).await.unwrap();

        let head = read_http_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        client
            .write_all(&Frame::text("hello", true).serialize())
            .await
            .unwrap();

        let reply = read_exact_frame(&mut client).await;
        assert_eq!(reply.header.opcode, Opcode::Text);
        assert_eq!(reply.payload_text(), "echo: hello");
    }

    #[tokio::test]
    async fn invalid_handshake_is_rejected_with_400() {
        let server = started(WebSocketServer::builder()).await;

        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let head = read_http_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn close_handshake_round_trip() {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let o = opens.clone();
        let c = closes.clone();

        let server = started(
            WebSocketServer::builder()
                .on_open(move |_| {
                    o.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move |_, code| {
                    assert_eq!(code, 1000);
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await;

        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        client.write_all(&upgrade_bytes()).await.unwrap();
        read_http_head(&mut client).await;

        // give the driver a beat to register the connection
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 1);

        let mut close = Frame::close(1000, "done");
        close.header.masked = true;
        close.masking_key = Some([1, 2, 3, 4]);
        client.write_all(&close.serialize()).await.unwrap();

        let echo = read_exact_frame(&mut client).await;
        assert_eq!(echo.header.opcode, Opcode::Close);
        assert_eq!(Frame::parse_close(&echo.payload), (1000, "done".to_string()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_open_connection() {
        let server = started(WebSocketServer::builder()).await;
        let addr = server.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&upgrade_bytes()).await.unwrap();
            read_http_head(&mut client).await;
            clients.push(client);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 3);

        server.broadcast_text("to everyone");

        for client in &mut clients {
            let frame = read_exact_frame(client).await;
            assert_eq!(frame.payload_text(), "to everyone");
        }
    }

    #[tokio::test]
    async fn heartbeat_pings_and_reaps_idle_connections() {
        let server = started(
            WebSocketServer::builder()
                .heartbeat_interval(Duration::from_millis(100))
                .max_inactivity_time(Duration::from_millis(350)),
        )
        .await;

        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        client.write_all(&upgrade_bytes()).await.unwrap();
        read_http_head(&mut client).await;

        // first we see pings, then the inactivity close
        let mut saw_ping = false;
        loop {
            let frame = read_exact_frame(&mut client).await;
            match frame.header.opcode {
                Opcode::Ping => saw_ping = true,
                Opcode::Close => {
                    let (code, reason) = Frame::parse_close(&frame.payload);
                    assert_eq!(code, CLOSE_GOING_AWAY);
                    assert_eq!(reason, "Inactivity timeout");
                    break;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(saw_ping, "heartbeat should ping before reaping");
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_end_to_end() {
        let server = started(WebSocketServer::builder()).await;

        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        client.write_all(&upgrade_bytes()).await.unwrap();
        read_http_head(&mut client).await;

        let mut ping = Frame::ping(b"stamp".to_vec());
        ping.header.masked = true;
        ping.masking_key = Some([9, 9, 9, 9]);
        client.write_all(&ping.serialize()).await.unwrap();

        let pong = read_exact_frame(&mut client).await;
        assert_eq!(pong.header.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"stamp");
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_stops() {
        let mut server = started(WebSocketServer::builder()).await;
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&upgrade_bytes()).await.unwrap();
        read_http_head(&mut client).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown().await;

        let frame = read_exact_frame(&mut client).await;
        assert_eq!(frame.header.opcode, Opcode::Close);
        assert_eq!(server.connection_count(), 0);
    }
}
