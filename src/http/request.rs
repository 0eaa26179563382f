//! Byte-level HTTP/1.1 request parsing.

use crate::{
    errors::ErrorKind,
    http::{
        multipart::{FilePart, MultipartParser},
        stream::{PushbackReader, CHUNK_SIZE},
        types::{self, Method},
    },
    limits::HttpLimits,
};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use tokio::io::AsyncRead;

/// A fully parsed, owned HTTP request.
///
/// The parser drains the transport before this value is built (multipart
/// file bodies are already streamed to disk), so a `Request` carries no live
/// I/O handle and can be moved freely between tasks.
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    protocol: String,
    headers: HashMap<String, String>,
    query_params: HashMap<String, String>,
    path_params: HashMap<String, String>,
    body: String,
    files: HashMap<String, FilePart>,
}

impl Request {
    /// Builds a request value, enforcing the construction-time invariants:
    /// header names are lowercased and a path containing `..` is rejected.
    pub(crate) fn new(
        method: Method,
        path: String,
        protocol: String,
        headers: HashMap<String, String>,
        query_params: HashMap<String, String>,
        body: String,
        files: HashMap<String, FilePart>,
    ) -> Result<Self, ErrorKind> {
        if path.contains("..") {
            return Err(ErrorKind::PathTraversal);
        }

        debug_assert!(
            headers.keys().all(|k| *k == k.to_lowercase()),
            "header names must be lowercased before construction"
        );

        Ok(Self {
            method,
            path,
            protocol,
            headers,
            query_params,
            path_params: HashMap::new(),
            body,
            files,
        })
    }

    /// Installs the path parameters captured by the router.
    pub(crate) fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The percent-decoded request path, without the query string.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The protocol token from the request line, e.g. `HTTP/1.1`.
    #[inline(always)]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns a header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// All headers, keyed by lowercased name.
    #[inline(always)]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// A decoded query parameter (or multipart form field; form fields win
    /// on conflict).
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    #[inline(always)]
    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// A path parameter captured by the matched route pattern.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    #[inline(always)]
    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    /// The request body, decoded per the `charset` parameter. Empty for
    /// multipart requests.
    #[inline(always)]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// An uploaded file recorded under its form-field name.
    pub fn file(&self, name: &str) -> Option<&FilePart> {
        self.files.get(name)
    }

    #[inline(always)]
    pub fn files(&self) -> &HashMap<String, FilePart> {
        &self.files
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|t| t.trim().to_lowercase().starts_with("application/json"))
            .unwrap_or(false)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

/// The byte-level request decoder.
///
/// Reads the head up to the `\r\n\r\n` terminator (a bare `\n\n` is
/// tolerated), then either consumes exactly `Content-Length` body bytes or
/// hands the stream to the multipart decoder.
pub struct RequestParser;

impl RequestParser {
    /// Parses one request off `stream`.
    pub async fn parse<R: AsyncRead + Unpin>(
        stream: R,
        limits: &HttpLimits,
    ) -> Result<Request, ErrorKind> {
        let mut reader = PushbackReader::new(stream);

        let head = reader.read_header_block(limits.header_block_size).await?;
        let head = String::from_utf8_lossy(&head);
        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let request_line = lines.next().unwrap_or("");
        let (method, path, protocol, query_params) = Self::parse_request_line(request_line)?;
        let headers = Self::parse_header_lines(lines);

        let content_type = headers.get("content-type").cloned();
        let boundary = content_type.as_deref().and_then(Self::multipart_boundary);

        if let Some(boundary) = boundary {
            let mut fields = query_params;
            let mut files = HashMap::new();
            MultipartParser::new(&mut reader, &boundary)
                .parse(limits, &mut fields, &mut files)
                .await?;
            return Request::new(method, path, protocol, headers, fields, String::new(), files);
        }

        let content_length = Self::content_length(&headers)?;
        if content_length > limits.body_size {
            return Err(ErrorKind::BodyTooLarge(content_length));
        }

        let body_bytes = Self::read_body(&mut reader, content_length).await?;
        let charset = content_type.as_deref().and_then(types::charset_param);
        let body = types::decode_charset(&body_bytes, charset);

        Request::new(method, path, protocol, headers, query_params, body, HashMap::new())
    }

    /// `METHOD SP PATH SP PROTO`: exactly three space-separated tokens.
    fn parse_request_line(
        line: &str,
    ) -> Result<(Method, String, String, HashMap<String, String>), ErrorKind> {
        let parts: Vec<&str> = line.split(' ').collect();
        let [method, target, protocol] = parts.as_slice() else {
            return Err(ErrorKind::MalformedRequestLine);
        };
        if method.is_empty() || target.is_empty() || protocol.is_empty() {
            return Err(ErrorKind::MalformedRequestLine);
        }

        let decoded = percent_decode_str(target).decode_utf8_lossy().into_owned();
        let method = Method::parse(method)?;

        let (path, query) = match decoded.find('?') {
            Some(i) => (decoded[..i].to_string(), &decoded[i + 1..]),
            None => (decoded.clone(), ""),
        };

        Ok((method, path, protocol.to_string(), Self::parse_query(query)))
    }

    /// `k=v(&k=v)*` with percent-decoding on each side; pieces without `=`
    /// are skipped; the last occurrence of a key wins.
    fn parse_query(query: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();

        for piece in query.split('&') {
            let Some(eq) = piece.find('=') else { continue };
            let key = percent_decode_str(&piece[..eq]).decode_utf8_lossy();
            if key.is_empty() {
                continue;
            }
            let value = percent_decode_str(&piece[eq + 1..]).decode_utf8_lossy();
            params.insert(key.into_owned(), value.into_owned());
        }

        params
    }

    /// Splits each line on the first `:`, trims both sides, lowercases the
    /// name. The first occurrence of a name wins; lines without a colon are
    /// ignored.
    fn parse_header_lines<'a, I: Iterator<Item = &'a str>>(lines: I) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        for line in lines {
            let Some(colon) = line.find(':') else { continue };
            let name = line[..colon].trim().to_lowercase();
            if name.is_empty() {
                continue;
            }
            let value = line[colon + 1..].trim().to_string();
            headers.entry(name).or_insert(value);
        }

        headers
    }

    fn content_length(headers: &HashMap<String, String>) -> Result<usize, ErrorKind> {
        match headers.get("content-length") {
            None => Ok(0),
            Some(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(0);
                }
                value
                    .parse::<usize>()
                    .map_err(|_| ErrorKind::InvalidContentLength)
            }
        }
    }

    async fn read_body<R: AsyncRead + Unpin>(
        reader: &mut PushbackReader<R>,
        length: usize,
    ) -> Result<Vec<u8>, ErrorKind> {
        let mut body = vec![0u8; length.min(CHUNK_SIZE)];
        let mut total = 0;

        while total < length {
            if body.len() < length {
                body.resize((body.len() + CHUNK_SIZE).min(length), 0);
            }
            let n = reader.read(&mut body[total..]).await?;
            if n == 0 {
                return Err(ErrorKind::UnexpectedEof);
            }
            total += n;
        }

        Ok(body)
    }

    /// Pulls the `boundary=` token out of a `multipart/form-data` content
    /// type, stripping surrounding quotes.
    fn multipart_boundary(content_type: &str) -> Option<String> {
        if !content_type.trim_start().starts_with("multipart/form-data") {
            return None;
        }

        let idx = content_type.find("boundary=")?;
        let raw = &content_type[idx + "boundary=".len()..];
        let raw = raw.split(';').next().unwrap_or(raw).trim();
        let token = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')).unwrap_or(raw);

        (!token.is_empty()).then(|| token.to_string())
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    async fn parse(raw: &str) -> Result<Request, ErrorKind> {
        RequestParser::parse(raw.as_bytes(), &HttpLimits::default()).await
    }

    #[tokio::test]
    async fn simple_get_with_query() {
        let req = parse("GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.protocol(), "HTTP/1.1");
        assert_eq!(req.query_param("name"), Some("world"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.body(), "");
    }

    #[tokio::test]
    async fn header_lookup_is_case_insensitive() {
        let req = parse("GET / HTTP/1.1\r\nX-Custom-ID: 42\r\n\r\n").await.unwrap();

        assert_eq!(req.header("x-custom-id"), Some("42"));
        assert_eq!(req.header("X-CUSTOM-ID"), Some("42"));
        assert_eq!(req.header("X-Custom-Id"), Some("42"));
    }

    #[tokio::test]
    async fn duplicate_header_first_wins() {
        let req = parse("GET / HTTP/1.1\r\nX-Multi: one\r\nX-Multi: two\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(req.header("x-multi"), Some("one"));
    }

    #[tokio::test]
    async fn percent_decoded_path_and_query() {
        let req = parse("GET /caf%C3%A9?greeting=hello%20world&a=1&a=2 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(req.path(), "/café");
        assert_eq!(req.query_param("greeting"), Some("hello world"));
        assert_eq!(req.query_param("a"), Some("2"));
    }

    #[tokio::test]
    async fn query_pieces_without_equals_are_skipped() {
        let req = parse("GET /?debug&name=x&=y HTTP/1.1\r\n\r\n").await.unwrap();

        assert_eq!(req.query_param("debug"), None);
        assert_eq!(req.query_param("name"), Some("x"));
        assert_eq!(req.query_params().len(), 1);
    }

    #[tokio::test]
    async fn bare_lf_terminator_tolerated() {
        let req = parse("POST /x HTTP/1.1\nContent-Length: 4\n\nbody").await.unwrap();

        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.body(), "body");
    }

    #[tokio::test]
    async fn body_read_exactly() {
        let req = parse("POST /upload HTTP/1.1\r\nContent-Length: 17\r\n\r\n{\"data\": \"value\"}")
            .await
            .unwrap();

        assert_eq!(req.body(), "{\"data\": \"value\"}");
        assert!(!req.is_json());
    }

    #[tokio::test]
    async fn body_charset_latin1() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Type: text/plain; charset=ISO-8859-1\r\nContent-Length: 2\r\n\r\nh\xE9";
        let req = RequestParser::parse(raw.as_ref(), &HttpLimits::default())
            .await
            .unwrap();

        assert_eq!(req.body(), "hé");
    }

    #[tokio::test]
    async fn missing_content_length_means_empty_body() {
        let req = parse("POST /x HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(req.body(), "");
    }

    #[tokio::test]
    async fn malformed_request_lines() {
        #[rustfmt::skip]
        let cases = [
            "GET /\r\n\r\n",
            "GET  / HTTP/1.1\r\n\r\n",
            "GET / HTTP/1.1 extra\r\n\r\n",
            "\r\n\r\n",
            " GET / HTTP/1.1\r\n\r\n",
        ];

        for raw in cases {
            assert!(
                matches!(parse(raw).await, Err(ErrorKind::MalformedRequestLine)),
                "{raw:?}"
            );
        }
    }

    #[tokio::test]
    async fn unsupported_methods() {
        for raw in ["TRACE / HTTP/1.1\r\n\r\n", "CONNECT / HTTP/1.1\r\n\r\n"] {
            assert!(matches!(
                parse(raw).await,
                Err(ErrorKind::UnsupportedMethod(_))
            ));
        }
    }

    #[tokio::test]
    async fn lowercase_method_accepted() {
        let req = parse("get / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(req.method(), Method::Get);
    }

    #[tokio::test]
    async fn path_traversal_rejected() {
        #[rustfmt::skip]
        let cases = [
            "GET /../etc/passwd HTTP/1.1\r\n\r\n",
            "GET /files/..%2Fsecret HTTP/1.1\r\n\r\n",
            "GET /a/%2e%2e/b HTTP/1.1\r\n\r\n",
        ];

        for raw in cases {
            assert!(matches!(parse(raw).await, Err(ErrorKind::PathTraversal)), "{raw:?}");
        }
    }

    #[tokio::test]
    async fn invalid_content_length() {
        for raw in [
            "POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n",
            "POST / HTTP/1.1\r\nContent-Length: 12.5\r\n\r\n",
            "POST / HTTP/1.1\r\nContent-Length: -4\r\n\r\n",
        ] {
            assert!(matches!(
                parse(raw).await,
                Err(ErrorKind::InvalidContentLength)
            ));
        }
    }

    #[tokio::test]
    async fn body_over_cap_rejected() {
        let raw = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            50 * 1024 * 1024 + 1
        );
        assert!(matches!(parse(&raw).await, Err(ErrorKind::BodyTooLarge(_))));
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        assert!(matches!(
            parse("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort").await,
            Err(ErrorKind::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn parsed_method_is_always_in_the_allowed_set() {
        let allowed = [
            Method::Get,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Head,
            Method::Options,
        ];

        for raw in [
            "GET / HTTP/1.1\r\n\r\n",
            "put /x HTTP/1.1\r\n\r\n",
            "OPTIONS /y HTTP/1.1\r\n\r\n",
        ] {
            let req = parse(raw).await.unwrap();
            assert!(allowed.contains(&req.method()));
            assert!(!req.path().contains(".."));
        }
    }
}

#[cfg(test)]
mod boundary_tests {
    use super::*;

    #[test]
    fn extraction() {
        #[rustfmt::skip]
        let cases = [
            ("multipart/form-data; boundary=xyz",        Some("xyz")),
            ("multipart/form-data; boundary=\"a b\"",    Some("a b")),
            ("multipart/form-data;boundary=q; x=1",      Some("q")),
            ("multipart/form-data",                      None),
            ("application/json",                         None),
            ("multipart/form-data; boundary=",           None),
        ];

        for (value, expected) in cases {
            assert_eq!(
                RequestParser::multipart_boundary(value).as_deref(),
                expected,
                "{value}"
            );
        }
    }
}
