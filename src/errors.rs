use crate::http::response::Response;
use std::io;
use thiserror::Error;

/// Errors raised while decoding a request off the wire.
///
/// Each variant carries a fixed HTTP status and a short machine-readable
/// code; [`ErrorKind::to_response`] renders the JSON body the server
/// answers with before closing the connection.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),
    #[error("request head too large")]
    HeaderBlockTooLarge,

    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("request body too large: {0} bytes")]
    BodyTooLarge(usize),
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("path traversal detected in request path")]
    PathTraversal,

    #[error("invalid multipart framing: {0}")]
    InvalidMultipart(String),
    #[error("invalid filename: {0}")]
    RejectedFilename(String),
    #[error("blocked file type: {0}")]
    BlockedExtension(String),
    #[error("uploaded file too large: {0}")]
    FileTooLarge(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

macro_rules! error_codes {
    ($($name:ident => $status:expr, $code:literal;)*) => {
        /// The HTTP status this error renders as.
        pub const fn status_code(&self) -> u16 {
            match self { $( Self::$name { .. } => $status, )* }
        }

        /// The machine-readable code carried in the JSON error body.
        pub const fn error_code(&self) -> &'static str {
            match self { $( Self::$name { .. } => $code, )* }
        }
    };
}

impl ErrorKind {
    error_codes! {
        MalformedRequestLine => 400, "MALFORMED_REQUEST_LINE";
        UnsupportedMethod    => 400, "UNSUPPORTED_METHOD";
        HeaderBlockTooLarge  => 400, "HEADER_BLOCK_TOO_LARGE";

        InvalidContentLength => 400, "INVALID_CONTENT_LENGTH";
        BodyTooLarge         => 400, "BODY_TOO_LARGE";
        UnexpectedEof        => 400, "UNEXPECTED_EOF";

        PathTraversal        => 403, "PATH_TRAVERSAL";

        InvalidMultipart     => 400, "INVALID_MULTIPART";
        RejectedFilename     => 403, "REJECTED_FILENAME";
        BlockedExtension     => 403, "BLOCKED_EXTENSION";
        FileTooLarge         => 400, "FILE_TOO_LARGE";

        Io                   => 400, "IO_ERROR";
    }

    /// Renders this error as the response the server writes before closing
    /// the connection.
    pub fn to_response(&self) -> Response {
        let mut resp = Response::new();
        resp.status(self.status_code())
            .json(format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                self.to_string().replace('"', "'"),
                self.error_code()
            ));
        resp
    }
}

/// Errors a route handler may return.
///
/// The router resolves these through its ordered `(predicate, handler)`
/// pairs; anything unmatched falls through to the built-in 500 page.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Application-defined error with a custom code.
    #[error("{message}")]
    App { code: String, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        #[rustfmt::skip]
        let cases = [
            (ErrorKind::MalformedRequestLine,                  400, "MALFORMED_REQUEST_LINE"),
            (ErrorKind::UnsupportedMethod("TRACE".into()),     400, "UNSUPPORTED_METHOD"),
            (ErrorKind::InvalidContentLength,                  400, "INVALID_CONTENT_LENGTH"),
            (ErrorKind::BodyTooLarge(99),                      400, "BODY_TOO_LARGE"),
            (ErrorKind::PathTraversal,                         403, "PATH_TRAVERSAL"),
            (ErrorKind::RejectedFilename("../x".into()),       403, "REJECTED_FILENAME"),
            (ErrorKind::BlockedExtension(".exe".into()),       403, "BLOCKED_EXTENSION"),
            (ErrorKind::FileTooLarge("big.png".into()),        400, "FILE_TOO_LARGE"),
            (ErrorKind::InvalidMultipart("no boundary".into()), 400, "INVALID_MULTIPART"),
        ];

        for (kind, status, code) in cases {
            assert_eq!(kind.status_code(), status);
            assert_eq!(kind.error_code(), code);
        }
    }

    #[test]
    fn render_response() {
        let bytes = ErrorKind::PathTraversal.to_response().to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with(r#"{"error":"path traversal detected in request path","code":"PATH_TRAVERSAL"}"#));
    }
}
