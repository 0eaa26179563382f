//! WebSocket HTTP upgrade handshake (RFC 6455 §4.2).

use crate::{
    errors::ErrorKind,
    http::{request::Request, response::Response, types::Method},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// RFC 6455 magic GUID concatenated with the client key for
/// `Sec-WebSocket-Accept`.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
const WEBSOCKET_VERSION: &str = "13";

/// Computes the `Sec-WebSocket-Accept` value:
/// `base64(SHA1(key + GUID))` per RFC 6455 §4.2.2.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Checks every upgrade requirement: `GET`, `Upgrade: websocket`
/// (case-insensitive), `Connection` containing `upgrade`
/// (case-insensitive), `Sec-WebSocket-Version: 13` and a present
/// `Sec-WebSocket-Key`.
pub fn is_valid_upgrade(request: &Request) -> bool {
    request.method() == Method::Get
        && request
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        && request
            .header("connection")
            .map(|v| v.to_lowercase().contains("upgrade"))
            .unwrap_or(false)
        && request
            .header("sec-websocket-version")
            .map(|v| v == WEBSOCKET_VERSION)
            .unwrap_or(false)
        && request.header("sec-websocket-key").is_some()
}

/// Builds the handshake response: `101 Switching Protocols` on success,
/// `400 Bad Request` otherwise.
pub fn handshake_response(request: &Request) -> Response {
    let mut response = Response::new();

    if !is_valid_upgrade(request) {
        response.bad_request().body("Invalid WebSocket request");
        return response;
    }

    // is_valid_upgrade guarantees the key header
    let key = request.header("sec-websocket-key").unwrap_or_default();
    response
        .status(101)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(key))
        .header("Sec-WebSocket-Version", WEBSOCKET_VERSION);
    response
}

/// The optional sub-protocol list offered by the client. Surfaced to the
/// application, otherwise unused.
pub fn sub_protocol(request: &Request) -> Option<&str> {
    request.header("sec-websocket-protocol")
}

/// The optional extensions offered by the client. Surfaced to the
/// application; no extension is ever negotiated.
pub fn extensions(request: &Request) -> Option<&str> {
    request.header("sec-websocket-extensions")
}

/// Parses the accumulated upgrade request head: request line plus headers,
/// CRLF or LF line endings. No body handling; an upgrade request carries
/// none.
pub(crate) fn parse_handshake_head(raw: &[u8]) -> Result<Request, ErrorKind> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let request_line = lines.next().unwrap_or("");
    let parts: Vec<&str> = request_line.split(' ').filter(|p| !p.is_empty()).collect();
    let [method, path, protocol] = parts.as_slice() else {
        return Err(ErrorKind::MalformedRequestLine);
    };
    let method = Method::parse(method)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.find(':') else { continue };
        let name = line[..colon].trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        headers.entry(name).or_insert_with(|| line[colon + 1..].trim().to_string());
    }

    Request::new(
        method,
        path.to_string(),
        protocol.to_string(),
        headers,
        HashMap::new(),
        String::new(),
        HashMap::new(),
    )
}
