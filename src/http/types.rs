//! Core HTTP protocol types and utilities

use crate::errors::ErrorKind;

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 7231, Section 4](https://datatracker.ietf.org/doc/html/rfc7231#section-4)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
///
/// # Disabled methods
///
/// * `TRACE` - disabled for security reasons
/// * `CONNECT` - disabled because it is no longer needed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method - transfer a current representation of the target resource
    /// [[RFC7231, Section 4.3.1](https://tools.ietf.org/html/rfc7231#section-4.3.1)]
    Get,
    /// POST method - perform resource-specific processing on the request payload
    /// [[RFC7231, Section 4.3.3](https://tools.ietf.org/html/rfc7231#section-4.3.3)]
    Post,
    /// PUT method - replace all current representations of the target resource
    /// [[RFC7231, Section 4.3.4](https://tools.ietf.org/html/rfc7231#section-4.3.4)]
    Put,
    /// DELETE method - remove all current representations of the target resource
    /// [[RFC7231, Section 4.3.5](https://tools.ietf.org/html/rfc7231#section-4.3.5)]
    Delete,
    /// PATCH method - apply partial modifications to a resource
    /// [[RFC5789, Section 2](https://tools.ietf.org/html/rfc5789#section-2)]
    Patch,
    /// HEAD method - same as GET but without response body
    /// [[RFC7231, Section 4.3.2](https://tools.ietf.org/html/rfc7231#section-4.3.2)]
    Head,
    /// OPTIONS method - describe the communication options for the target resource
    /// [[RFC7231, Section 4.3.7](https://tools.ietf.org/html/rfc7231#section-4.3.7)]
    Options,
}

impl Method {
    /// Parses a method token, case-insensitively, against the supported set.
    pub fn parse(token: &str) -> Result<Self, ErrorKind> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(ErrorKind::UnsupportedMethod(token.to_string())),
        }
    }

    /// Returns the canonical uppercase token.
    #[inline(always)]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// STATUS REASON

/// Returns the reason phrase for an HTTP status code.
///
/// Codes outside the well-known set resolve to `"Unknown"`; the status line
/// is still emitted with the numeric code.
pub(crate) const fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

// HEADER NAME CANONICALIZATION

/// Canonicalizes a header name to `First-Letter-Upper` per hyphenated token,
/// e.g. `content-type` becomes `Content-Type` and `x-frame-options` becomes
/// `X-Frame-Options`.
///
/// Interior casing is preserved so that mixed-case names such as
/// `Sec-WebSocket-Accept` emit unchanged.
pub(crate) fn canonicalize_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;

    for ch in name.chars() {
        if ch == '-' {
            out.push('-');
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }

    out
}

// CHARSET

/// Decodes body bytes per the `charset` parameter of `Content-Type`.
///
/// UTF-8 is the default and the fallback for unrecognized names; Latin-1
/// (`iso-8859-1`) maps each byte to the code point of the same value.
pub(crate) fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
    match charset.map(|c| c.trim().to_ascii_lowercase()) {
        Some(name) if name == "iso-8859-1" || name == "latin-1" || name == "latin1" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Extracts the `charset` parameter from a `Content-Type` value, e.g.
/// `text/html; charset=ISO-8859-1`.
pub(crate) fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|part| {
        let part = part.trim();
        if part.len() >= 8 && part.as_bytes()[..8].eq_ignore_ascii_case(b"charset=") {
            Some(part[8..].trim().trim_matches('"'))
        } else {
            None
        }
    })
}


#[cfg(test)]
mod header_name_tests {
    use super::*;

    #[test]
    fn canonicalize() {
        #[rustfmt::skip]
        let cases = [
            ("content-type",           "Content-Type"),
            ("x-content-type-options", "X-Content-Type-Options"),
            ("Server",                 "Server"),
            ("Sec-WebSocket-Accept",   "Sec-WebSocket-Accept"),
            ("date",                   "Date"),
            ("",                       ""),
        ];

        for (input, expected) in cases {
            assert_eq!(canonicalize_header_name(input), expected);
        }
    }
}
