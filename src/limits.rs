//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion from oversized bodies and uploads
//! - Memory overflows from unbounded header blocks
//! - Idle WebSocket connections pinning resources forever
//!
//! # Examples
//!
//! ```no_run
//! use ember_web::{HttpServer, Router, limits::HttpLimits};
//!
//! #[tokio::main]
//! async fn main() {
//!     HttpServer::builder()
//!         .router(Router::new())
//!         .limits(HttpLimits {
//!             body_size: 16 * 1024 * 1024, // tighter body cap
//!             ..HttpLimits::default()
//!         })
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Limits applied while parsing and answering HTTP requests.
///
/// Default values mirror the protections the server ships with. Only
/// change them if you understand the consequences.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Port the HTTP server binds when no explicit listener is supplied
    /// (default: `8080`).
    pub port: u16,

    /// Maximum size of the request head, request line plus headers, in
    /// bytes (default: `64 KiB`).
    ///
    /// A request whose header terminator has not appeared within this many
    /// bytes is rejected with `400`.
    pub header_block_size: usize,

    /// Maximum `Content-Length` accepted for a request body
    /// (default: `50 MiB`).
    pub body_size: usize,

    /// Maximum size of a single uploaded file inside a multipart body
    /// (default: `100 MiB`).
    ///
    /// The cap is enforced while streaming; a partially written temp file
    /// is deleted before the error propagates.
    pub file_size: usize,

    /// Directory that uploaded files are streamed into (default: `temp/`,
    /// relative to the process working directory).
    ///
    /// Created on demand. Files receive unique generated names; removal on
    /// process exit is best-effort.
    pub upload_dir: PathBuf,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            port: 8080,
            header_block_size: 64 * 1024,
            body_size: 50 * 1024 * 1024,
            file_size: 100 * 1024 * 1024,
            upload_dir: PathBuf::from("temp"),

            _priv: (),
        }
    }
}

/// Limits and timers for the WebSocket server.
///
/// # Heartbeat
///
/// A dedicated task wakes every [`heartbeat_interval`](Self::heartbeat_interval):
/// connections idle longer than [`max_inactivity_time`](Self::max_inactivity_time)
/// are closed with `1001 "Inactivity timeout"`, every other open connection
/// receives a `PING`.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Port the WebSocket server binds (default: `8081`).
    pub port: u16,

    /// Idle time after which a connection is closed by the heartbeat
    /// (default: `5 minutes`).
    ///
    /// Every received frame and every enqueued send refreshes the
    /// connection's activity timestamp.
    pub max_inactivity_time: Duration,

    /// Maximum number of bytes accumulated for the HTTP upgrade request
    /// before the handshake is abandoned (default: `16 MiB`).
    ///
    /// This bounds the handshake request as a whole, not individual frames.
    pub max_message_size: usize,

    /// How often the heartbeat task wakes (default: `30 seconds`).
    pub heartbeat_interval: Duration,

    /// Capacity of the per-connection FIFO send queue (default: `1000`).
    ///
    /// Enqueueing on a full queue is a programming error and surfaces as
    /// [`WsError::QueueFull`](crate::ws::connection::WsError::QueueFull).
    pub send_queue_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            port: 8081,
            max_inactivity_time: Duration::from_secs(5 * 60),
            max_message_size: 16 * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            send_queue_capacity: 1000,

            _priv: (),
        }
    }
}
