//! HTTP response construction and serialization.

use crate::http::types::{canonicalize_header_name, reason_phrase};
use std::time::SystemTime;

/// A `Set-Cookie` entry.
///
/// Attributes are emitted in order as `; key=value`. [`Cookie::new`] applies
/// the hardened defaults `HttpOnly` and `SameSite=Lax`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub attributes: Vec<(String, String)>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            attributes: vec![
                ("HttpOnly".to_string(), "true".to_string()),
                ("SameSite".to_string(), "Lax".to_string()),
            ],
        }
    }

    pub fn with_attributes(
        name: impl Into<String>,
        value: impl Into<String>,
        attributes: Vec<(String, String)>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            attributes,
        }
    }

    fn serialize(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        for (key, value) in &self.attributes {
            out.push_str("; ");
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

/// Mutable HTTP response builder.
///
/// Constructed with the default security headers already in place; every
/// default can be overridden by a later [`header()`](Response::header) call
/// (comparison is case-insensitive, insertion order is preserved).
/// Serialization computes `Content-Length` from the UTF-8 byte length of the
/// body (do not set it by hand) and the server always answers
/// `Connection: close`.
///
/// # Examples
/// ```
/// use ember_web::Response;
///
/// let mut resp = Response::new();
/// resp.status(200)
///     .content_type("text/plain")
///     .body("Hello, World!");
/// let bytes = resp.to_bytes();
/// assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status_code: u16,
    status_reason: &'static str,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// Creates a `200 OK` response carrying the default headers.
    pub fn new() -> Self {
        let mut resp = Self {
            status_code: 200,
            status_reason: reason_phrase(200),
            headers: Vec::with_capacity(8),
            cookies: Vec::new(),
            body: String::new(),
        };

        resp.header("Server", "ember_web/0.1")
            .header("Date", httpdate::fmt_http_date(SystemTime::now()))
            .header("X-Content-Type-Options", "nosniff")
            .header("X-Frame-Options", "DENY")
            .header("X-XSS-Protection", "1; mode=block")
            .header("Connection", "close");
        resp
    }

    /// Sets the status code.
    ///
    /// # Panics
    /// Panics when `code` is outside `100..=599`; that is a programming
    /// error, not a runtime condition.
    #[track_caller]
    pub fn status(&mut self, code: u16) -> &mut Self {
        assert!(
            (100..=599).contains(&code),
            "Invalid HTTP status code: {code}"
        );
        self.status_code = code;
        self.status_reason = reason_phrase(code);
        self
    }

    #[inline(always)]
    pub const fn status_code(&self) -> u16 {
        self.status_code
    }

    #[inline(always)]
    pub const fn status_reason(&self) -> &'static str {
        self.status_reason
    }

    pub fn ok(&mut self) -> &mut Self {
        self.status(200)
    }
    pub fn created(&mut self) -> &mut Self {
        self.status(201)
    }
    pub fn bad_request(&mut self) -> &mut Self {
        self.status(400)
    }
    pub fn unauthorized(&mut self) -> &mut Self {
        self.status(401)
    }
    pub fn forbidden(&mut self) -> &mut Self {
        self.status(403)
    }
    pub fn not_found(&mut self) -> &mut Self {
        self.status(404)
    }
    pub fn internal_error(&mut self) -> &mut Self {
        self.status(500)
    }

    /// Sets a header, replacing any existing value under the same
    /// (case-insensitively compared) name while keeping its position.
    ///
    /// `Content-Length` is computed by the serializer and must not be set
    /// here.
    #[track_caller]
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        debug_assert!(
            !name.eq_ignore_ascii_case("content-length"),
            "Content-Length is computed during serialization"
        );
        if name.eq_ignore_ascii_case("content-length") {
            return self;
        }

        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    /// Returns a header value with case-insensitive name matching.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.header("Content-Type", content_type)
    }

    /// Sets the response body. No content type is forced.
    pub fn body(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = body.into();
        self
    }

    #[inline(always)]
    pub fn body_str(&self) -> &str {
        &self.body
    }

    /// Sets a JSON body and content type.
    pub fn json(&mut self, json: impl Into<String>) -> &mut Self {
        self.body = json.into();
        self.content_type("application/json; charset=utf-8")
    }

    /// Sets an HTML body and content type.
    pub fn html(&mut self, html: impl Into<String>) -> &mut Self {
        self.body = html.into();
        self.content_type("text/html; charset=utf-8")
    }

    /// Adds a cookie with the default `HttpOnly` / `SameSite=Lax`
    /// attributes.
    pub fn cookie(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.cookies.push(Cookie::new(name, value));
        self
    }

    /// Adds a cookie with explicit attributes.
    pub fn cookie_with(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        attributes: Vec<(String, String)>,
    ) -> &mut Self {
        self.cookies
            .push(Cookie::with_attributes(name, value, attributes));
        self
    }

    #[inline(always)]
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Serializes the response into a single byte block. Header names are
    /// canonicalized here; `Content-Length` is emitted only for non-empty
    /// bodies.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256 + self.body.len());

        out.push_str("HTTP/1.1 ");
        out.push_str(&self.status_code.to_string());
        out.push(' ');
        out.push_str(self.status_reason);
        out.push_str("\r\n");

        for (name, value) in &self.headers {
            out.push_str(&canonicalize_header_name(name));
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }

        for cookie in &self.cookies {
            out.push_str("Set-Cookie: ");
            out.push_str(&cookie.serialize());
            out.push_str("\r\n");
        }

        if !self.body.is_empty() {
            out.push_str("Content-Length: ");
            out.push_str(&self.body.len().to_string());
            out.push_str("\r\n");
        }

        out.push_str("\r\n");
        out.push_str(&self.body);

        out.into_bytes()
    }
}

#[cfg(test)]
mod status_tests {
    use super::*;

    #[test]
    fn basic() {
        #[rustfmt::skip]
        let cases = [
            (200, "OK"),
            (101, "Switching Protocols"),
            (302, "Found"),
            (404, "Not Found"),
            (500, "Internal Server Error"),
            (599, "Unknown"),
        ];

        for (code, reason) in cases {
            let mut resp = Response::new();
            resp.status(code);

            assert_eq!(resp.status_code(), code);
            assert_eq!(resp.status_reason(), reason);

            let text = String::from_utf8(resp.to_bytes()).unwrap();
            assert!(text.starts_with(&format!("HTTP/1.1 {code} {reason}\r\n")));
        }
    }

    #[test]
    fn shorthand_setters() {
        let mut resp = Response::new();
        assert_eq!(resp.not_found().status_code(), 404);
        assert_eq!(resp.internal_error().status_code(), 500);
        assert_eq!(resp.ok().status_code(), 200);
    }

    #[test]
    #[should_panic(expected = "Invalid HTTP status code")]
    fn out_of_range() {
        Response::new().status(600);
    }
}



#[cfg(test)]
mod cookie_tests {
    use super::*;

    #[test]
    fn default_attributes() {
        let mut resp = Response::new();
        resp.cookie("session", "abc123");

        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("Set-Cookie: session=abc123; HttpOnly=true; SameSite=Lax\r\n"));
    }

    #[test]
    fn explicit_attributes_and_order() {
        let mut resp = Response::new();
        resp.cookie_with(
            "pref",
            "dark",
            vec![
                ("Path".to_string(), "/".to_string()),
                ("Max-Age".to_string(), "3600".to_string()),
            ],
        );
        resp.cookie("second", "2");

        let text = String::from_utf8(resp.to_bytes()).unwrap();
        let first = text.find("Set-Cookie: pref=dark; Path=/; Max-Age=3600\r\n").unwrap();
        let second = text.find("Set-Cookie: second=2").unwrap();
        assert!(first < second);
    }
}
