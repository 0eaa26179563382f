//! ember_web - Self-contained HTTP/1.1 + WebSocket server, no framework
//!
//! A wire-and-protocol engine built directly on [`tokio`]: a byte-level
//! HTTP/1.1 request parser (including streaming `multipart/form-data` to
//! disk), a path-parameterized router with middleware chaining, an HTTP
//! response serializer, and a full RFC 6455 WebSocket server (handshake,
//! frame codec, per-connection lifecycle, heartbeat, broadcast).
//!
//! # Features
//!
//! ## 🌐 HTTP/1.1
//! - **Byte-accurate request parsing** - request line, headers, body, with
//!   CRLF/LF tolerance and percent-decoded paths.
//! - **Streaming multipart uploads** - boundary-delimited part bodies are
//!   streamed to `temp/` in 8 KiB chunks, never buffered in memory.
//! - **Path-parameterized routing** - `/users/:id` patterns, middleware
//!   chaining, ordered error-handler dispatch.
//! - **One request per connection** - the server always answers
//!   `Connection: close`; no keep-alive bookkeeping to get wrong.
//!
//! ## 🔌 WebSocket (RFC 6455)
//! - **Handshake validation** and `Sec-WebSocket-Accept` derivation.
//! - **Frame codec** - all three payload-length encodings, XOR masking,
//!   control frames.
//! - **Connection lifecycle** - `OPEN → CLOSING → CLOSED`, close handshake,
//!   bounded send queues, heartbeat with inactivity reaping, broadcast.
//!
//! ## 🔒 Hardened defaults
//! - Security response headers out of the box (`X-Content-Type-Options`,
//!   `X-Frame-Options`, `X-XSS-Protection`).
//! - Path-traversal rejection, upload filename policy, blocked-extension
//!   list, body and file size caps.
//!
//! # Quick Start
//!
//! ```no_run
//! use ember_web::{HttpServer, Request, Response, Router};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = Router::new();
//!     router.get("/hello", |req: &Request, resp: &mut Response| {
//!         Box::pin(async move {
//!             let name = req.query_param("name").unwrap_or("world");
//!             resp.ok().body(format!("hi {name}"));
//!             Ok(())
//!         })
//!     });
//!
//!     HttpServer::builder()
//!         .router(router)
//!         .port(8080)
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! For the WebSocket side, see [`WebSocketServer`].
pub mod http {
    pub mod multipart;
    pub mod request;
    pub mod response;
    pub mod router;
    pub mod server;
    pub(crate) mod stream;
    pub mod types;
}
pub mod ws {
    pub mod connection;
    pub mod frame;
    pub mod handshake;
    pub mod server;
}
pub mod errors;
pub mod limits;

pub use crate::{
    errors::{ErrorKind, HandlerError},
    http::{
        multipart::FilePart,
        request::{Request, RequestParser},
        response::{Cookie, Response},
        router::{HandlerFuture, Router},
        server::{HttpServer, HttpServerBuilder, PreFilter},
        types::Method,
    },
    ws::{
        connection::{WebSocketConnection, WsError},
        frame::{Frame, FrameHeader, Opcode},
        server::{WebSocketServer, WebSocketServerBuilder},
    },
};
