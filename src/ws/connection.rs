//! Per-connection WebSocket state: lifecycle flags, send queue, frame
//! dispatch.
//!
//! The connection owns no socket. Its driver task (spawned by the server
//! loop) performs all reads and writes, draining the bounded send queue and
//! feeding received bytes back in; everything here is therefore safe to
//! touch from the heartbeat and from `broadcast` concurrently.

use crate::ws::frame::{Frame, FrameError, Opcode};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// Close status codes per
/// [RFC 6455 §7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED: u16 = 1003;
/// Abnormal closure; never sent on the wire, local bookkeeping only.
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_INVALID_DATA: u16 = 1007;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TOO_LARGE: u16 = 1009;
pub const CLOSE_SERVER_ERROR: u16 = 1011;

/// Errors surfaced to callers of the send API and to `on_error`.
#[derive(Debug, Error)]
pub enum WsError {
    /// The connection is no longer open.
    #[error("connection is closed")]
    Closed,
    /// The bounded send queue is full. Enqueueing past the cap is a
    /// programming error; back off or close the connection.
    #[error("send queue is full")]
    QueueFull,
    /// The peer violated the framing protocol.
    #[error("websocket protocol error: {0}")]
    Protocol(String),
    /// The transport failed mid-connection.
    #[error("websocket transport error: {0}")]
    Transport(String),
}

/// The five application callbacks. Every slot defaults to a no-op.
///
/// Callbacks execute on the connection's driver task: a long-running
/// callback stalls that connection (and only that connection). Offload
/// heavy work to your own executor.
pub struct WsCallbacks {
    pub(crate) on_open: Arc<dyn Fn(&Arc<WebSocketConnection>) + Send + Sync>,
    pub(crate) on_message: Arc<dyn Fn(&Arc<WebSocketConnection>, String) + Send + Sync>,
    pub(crate) on_binary_message: Arc<dyn Fn(&Arc<WebSocketConnection>, Vec<u8>) + Send + Sync>,
    pub(crate) on_close: Arc<dyn Fn(&Arc<WebSocketConnection>, u16) + Send + Sync>,
    pub(crate) on_error: Arc<dyn Fn(&Arc<WebSocketConnection>, &WsError) + Send + Sync>,
}

impl Default for WsCallbacks {
    fn default() -> Self {
        Self {
            on_open: Arc::new(|_| {}),
            on_message: Arc::new(|_, _| {}),
            on_binary_message: Arc::new(|_, _| {}),
            on_close: Arc::new(|_, _| {}),
            on_error: Arc::new(|_, _| {}),
        }
    }
}

/// One accepted WebSocket connection.
///
/// Lifecycle: `OPEN → CLOSING → CLOSED`, driven by the `connected` and
/// `closing` flags. `on_close` fires exactly once, on the transition to
/// CLOSED; after that no further events are delivered for this connection.
pub struct WebSocketConnection {
    id: Uuid,
    connected: AtomicBool,
    closing: AtomicBool,
    close_code: AtomicU16,
    last_activity: AtomicU64,
    send_queue: ArrayQueue<Vec<u8>>,
    writable: Notify,
    remote_addr: String,
    connected_at: SystemTime,
    closed_at: Mutex<Option<SystemTime>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

impl WebSocketConnection {
    pub(crate) fn new(remote_addr: String, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            close_code: AtomicU16::new(CLOSE_NORMAL),
            last_activity: AtomicU64::new(now_millis()),
            send_queue: ArrayQueue::new(queue_capacity),
            writable: Notify::new(),
            remote_addr,
            connected_at: SystemTime::now(),
            closed_at: Mutex::new(None),
        })
    }

    #[inline(always)]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[inline(always)]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    #[inline(always)]
    pub const fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn closed_at(&self) -> Option<SystemTime> {
        *self.closed_at.lock().unwrap()
    }

    /// `true` until the CLOSED transition.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `true` once a close has been initiated, locally or by the peer.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Milliseconds (UNIX epoch) of the last frame or send.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Time since the last activity.
    pub fn inactivity(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity()))
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// The close code that will be (or was) reported to `on_close`.
    pub fn close_code(&self) -> u16 {
        self.close_code.load(Ordering::Acquire)
    }

    // Send path

    /// Queues a text frame (server frames are never masked).
    pub fn send_text(&self, message: &str) -> Result<(), WsError> {
        self.enqueue_checked(Frame::text(message, false).serialize())
    }

    /// Queues a binary frame.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.enqueue_checked(Frame::binary(data.to_vec(), false).serialize())
    }

    /// Queues a ping. A no-op on a connection that is no longer open.
    ///
    /// Pings do not refresh the activity timestamp (only peer frames and
    /// application sends do), so the inactivity reaper still fires for a
    /// silent peer.
    pub fn ping(&self) {
        if self.is_connected() && !self.is_closing() {
            let _ = self.enqueue(Frame::ping(Vec::new()).serialize());
        }
    }

    /// Queues a pong echoing `payload`. A no-op when not open.
    pub fn pong(&self, payload: Vec<u8>) {
        if self.is_connected() {
            let _ = self.enqueue(Frame::pong(payload).serialize());
        }
    }

    /// Initiates the close handshake: marks the connection CLOSING and
    /// queues the close frame. The driver flushes the queue and completes
    /// the shutdown. Repeated calls are no-ops.
    pub fn close(&self, code: u16, reason: &str) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.close_code.store(code, Ordering::Release);
            let _ = self.enqueue(Frame::close(code, reason).serialize());
        }
    }

    fn enqueue_checked(&self, bytes: Vec<u8>) -> Result<(), WsError> {
        if !self.is_connected() || self.is_closing() {
            return Err(WsError::Closed);
        }
        self.enqueue(bytes)?;
        self.touch();
        Ok(())
    }

    fn enqueue(&self, bytes: Vec<u8>) -> Result<(), WsError> {
        self.send_queue.push(bytes).map_err(|_| WsError::QueueFull)?;
        self.writable.notify_one();
        Ok(())
    }

    /// Next queued buffer, FIFO.
    pub(crate) fn pop_send(&self) -> Option<Vec<u8>> {
        self.send_queue.pop()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Resolves when the driver should drain the queue.
    pub(crate) async fn wait_writable(&self) {
        self.writable.notified().await;
    }

    pub(crate) fn notify_writable(&self) {
        self.writable.notify_one();
    }

    /// Performs the CLOSING → CLOSED transition. Returns `true` only for
    /// the call that actually transitioned, so `on_close` fires once.
    pub(crate) fn finish_close(&self, code: u16) -> bool {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.closing.store(true, Ordering::Release);
            self.close_code.store(code, Ordering::Release);
            *self.closed_at.lock().unwrap() = Some(SystemTime::now());
            // wake a driver that is parked on the queue
            self.writable.notify_one();
            true
        } else {
            false
        }
    }

    // Receive path

    /// Decodes every complete frame in `pending` and dispatches it.
    /// Returns `true` when a CLOSE frame was processed (the echo, when one
    /// was due, is already queued). Incomplete trailing bytes stay in
    /// `pending` for the next read.
    pub(crate) fn handle_data(
        conn: &Arc<Self>,
        pending: &mut Vec<u8>,
        callbacks: &WsCallbacks,
    ) -> Result<bool, WsError> {
        let mut close_received = false;

        while !pending.is_empty() && conn.is_connected() {
            match Frame::parse(pending) {
                Ok((frame, consumed)) => {
                    pending.drain(..consumed);
                    if Self::handle_frame(conn, frame, callbacks)? {
                        close_received = true;
                    }
                }
                Err(FrameError::Insufficient) => break,
                Err(err) => return Err(WsError::Protocol(err.to_string())),
            }
        }

        Ok(close_received)
    }

    /// Per-opcode dispatch. Fragmented messages are not supported:
    /// CONTINUATION is a protocol error.
    fn handle_frame(
        conn: &Arc<Self>,
        frame: Frame,
        callbacks: &WsCallbacks,
    ) -> Result<bool, WsError> {
        conn.touch();

        match frame.header.opcode {
            Opcode::Text => {
                (callbacks.on_message)(conn, frame.payload_text());
                Ok(false)
            }
            Opcode::Binary => {
                (callbacks.on_binary_message)(conn, frame.payload);
                Ok(false)
            }
            Opcode::Ping => {
                conn.pong(frame.payload);
                Ok(false)
            }
            Opcode::Pong => Ok(false),
            Opcode::Close => {
                let (code, reason) = Frame::parse_close(&frame.payload);
                if conn
                    .closing
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    conn.close_code.store(code, Ordering::Release);
                    let _ = conn.enqueue(Frame::close(code, &reason).serialize());
                }
                Ok(true)
            }
            Opcode::Continuation => Err(WsError::Protocol(
                "continuation frames not supported".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("remote", &self.remote_addr)
            .field("connected", &self.is_connected())
            .field("closing", &self.is_closing())
            .finish()
    }
}


#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn close_is_idempotent_and_queues_one_frame() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);

        conn.close(CLOSE_GOING_AWAY, "Inactivity timeout");
        conn.close(CLOSE_NORMAL, "again");

        let bytes = conn.pop_send().unwrap();
        let (frame, _) = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.header.opcode, Opcode::Close);
        assert_eq!(
            Frame::parse_close(&frame.payload),
            (CLOSE_GOING_AWAY, "Inactivity timeout".to_string())
        );
        assert!(conn.pop_send().is_none());

        assert!(conn.is_closing());
        assert!(conn.is_connected());
        assert_eq!(conn.close_code(), CLOSE_GOING_AWAY);
    }

    #[test]
    fn finish_close_transitions_exactly_once() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);

        assert!(conn.finish_close(CLOSE_NORMAL));
        assert!(!conn.finish_close(CLOSE_NORMAL));
        assert!(!conn.is_connected());
        assert!(conn.closed_at().is_some());
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recording_callbacks() -> (WsCallbacks, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let texts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));

        let t = texts.clone();
        let c = closes.clone();
        let callbacks = WsCallbacks {
            on_message: Arc::new(move |_, msg| t.lock().unwrap().push(msg)),
            on_close: Arc::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            ..WsCallbacks::default()
        };

        (callbacks, texts, closes)
    }

    #[test]
    fn text_frames_reach_the_text_handler() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);
        let (callbacks, texts, _) = recording_callbacks();

        let mut pending = Frame::text("first", true).serialize();
        pending.extend(Frame::text("second", false).serialize());

        let closed = WebSocketConnection::handle_data(&conn, &mut pending, &callbacks).unwrap();
        assert!(!closed);
        assert!(pending.is_empty());
        assert_eq!(*texts.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn binary_frames_reach_the_binary_handler() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let callbacks = WsCallbacks {
            on_binary_message: Arc::new(move |_, data| r.lock().unwrap().push(data)),
            ..WsCallbacks::default()
        };

        let mut pending = Frame::binary(vec![1, 2, 3], true).serialize();
        WebSocketConnection::handle_data(&conn, &mut pending, &callbacks).unwrap();

        assert_eq!(*received.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn ping_is_answered_with_matching_pong() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);
        let callbacks = WsCallbacks::default();

        let mut pending = Frame::ping(b"echo me".to_vec()).serialize();
        WebSocketConnection::handle_data(&conn, &mut pending, &callbacks).unwrap();

        let reply = conn.pop_send().unwrap();
        let (frame, _) = Frame::parse(&reply).unwrap();
        assert_eq!(frame.header.opcode, Opcode::Pong);
        assert_eq!(frame.payload, b"echo me");
    }

    #[test]
    fn pong_is_a_no_op() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);

        let mut pending = Frame::pong(b"x".to_vec()).serialize();
        WebSocketConnection::handle_data(&conn, &mut pending, &WsCallbacks::default()).unwrap();

        assert!(conn.pop_send().is_none());
    }

    #[test]
    fn close_frame_is_echoed_once_and_reported() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);

        let mut pending = Frame::close(1001, "bye").serialize();
        let closed = WebSocketConnection::handle_data(&conn, &mut pending, &WsCallbacks::default()).unwrap();
        assert!(closed);
        assert!(conn.is_closing());
        assert_eq!(conn.close_code(), 1001);

        let echo = conn.pop_send().unwrap();
        let (frame, _) = Frame::parse(&echo).unwrap();
        assert_eq!(Frame::parse_close(&frame.payload), (1001, "bye".to_string()));
    }

    #[test]
    fn close_frame_after_local_close_is_not_echoed() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);
        conn.close(CLOSE_NORMAL, "local");
        let _ = conn.pop_send(); // local close frame

        let mut pending = Frame::close(1000, "peer").serialize();
        let closed = WebSocketConnection::handle_data(&conn, &mut pending, &WsCallbacks::default()).unwrap();

        assert!(closed);
        assert!(conn.pop_send().is_none());
    }

    #[test]
    fn continuation_is_a_protocol_error() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);

        let mut frame = Frame::text("fragment", false);
        frame.header.opcode = Opcode::Continuation;
        let mut pending = frame.serialize();

        assert!(matches!(
            WebSocketConnection::handle_data(&conn, &mut pending, &WsCallbacks::default()),
            Err(WsError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);

        let mut pending = vec![0x83, 0x00];
        assert!(matches!(
            WebSocketConnection::handle_data(&conn, &mut pending, &WsCallbacks::default()),
            Err(WsError::Protocol(_))
        ));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);
        let (callbacks, texts, _) = recording_callbacks();

        let full = Frame::text("split", false).serialize();
        let mut pending = full[..3].to_vec();

        WebSocketConnection::handle_data(&conn, &mut pending, &callbacks).unwrap();
        assert_eq!(pending.len(), 3, "partial bytes are kept");
        assert!(texts.lock().unwrap().is_empty());

        pending.extend_from_slice(&full[3..]);
        WebSocketConnection::handle_data(&conn, &mut pending, &callbacks).unwrap();
        assert_eq!(*texts.lock().unwrap(), vec!["split"]);
    }

    #[test]
    fn no_events_after_closed() {
        let conn = WebSocketConnection::new("127.0.0.1:9".into(), 10);
        let (callbacks, texts, _) = recording_callbacks();

        conn.finish_close(CLOSE_NORMAL);

        let mut pending = Frame::text("too late", false).serialize();
        WebSocketConnection::handle_data(&conn, &mut pending, &callbacks).unwrap();

        assert!(texts.lock().unwrap().is_empty());
    }
}
