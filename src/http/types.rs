#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

use crate::errors::{Error, ErrorKind};
use std::{fmt, str::FromStr};

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 7231, Section 4](https://datatracker.ietf.org/doc/html/rfc7231#section-4)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
///
/// `TRACE` and `CONNECT` are not accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Head,
    Patch,
    Delete,
    Options,
}

impl Method {
    // Parses the method at the start of a request line, returning it and the
    // offset of the first byte after the separating space.
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<(Self, usize), ErrorKind> {
        match src {
            [b'G', b'E', b'T', b' ', ..] => Ok((Method::Get, 4)),
            [b'P', b'U', b'T', b' ', ..] => Ok((Method::Put, 4)),
            [b'P', b'O', b'S', b'T', b' ', ..] => Ok((Method::Post, 5)),
            [b'H', b'E', b'A', b'D', b' ', ..] => Ok((Method::Head, 5)),
            [b'P', b'A', b'T', b'C', b'H', b' ', ..] => Ok((Method::Patch, 6)),
            [b'D', b'E', b'L', b'E', b'T', b'E', b' ', ..] => Ok((Method::Delete, 7)),
            [b'O', b'P', b'T', b'I', b'O', b'N', b'S', b' ', ..] => Ok((Method::Options, 8)),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut line = Vec::with_capacity(s.len() + 1);
        line.extend_from_slice(s.as_bytes());
        line.push(b' ');

        match Method::from_bytes(&line) {
            Ok((method, len)) if len == line.len() => Ok(method),
            _ => Err(Error::contract(format!("{s:?} is not a supported method"))),
        }
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,

    /// HTTP/1.1 - [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    Http11,
}

impl Version {
    // Returns the version and whether connections persist by default.
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<(Self, bool), ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok((Self::Http11, true)),
            b"HTTP/1.0" => Ok((Self::Http10, false)),
            [b'H', b'T', b'T', b'P', b'/', ..] => Err(ErrorKind::UnsupportedVersion),
            _ => Err(ErrorKind::InvalidVersion),
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        /// HTTP status codes
        ///
        /// Represents valid HTTP status codes as defined in
        /// [RFC 7231](https://tools.ietf.org/html/rfc7231#section-6) and other standards.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the HTTP first line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn into_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// Status line without the protocol, e.g. `"404 Not Found"`.
            #[inline]
            pub const fn status_line(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => concat!($num, " ", $str),
                )+ }
            }

            /// Reason phrase, e.g. `"Not Found"`.
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            #[inline]
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    PartialContent = (206, "Partial Content");

    MultipleChoices = (300, "Multiple Choices");
    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    UnprocessableEntity = (422, "Unprocessable Entity");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    #[inline]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// `true` for 4xx and 5xx codes.
    #[inline]
    pub const fn is_error(&self) -> bool {
        self.as_u16() >= 400
    }

    #[inline]
    pub const fn is_redirect(&self) -> bool {
        matches!(self.as_u16(), 300..=399)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        #[rustfmt::skip]
        let cases = [
            ("GET",     Some(Method::Get)),
            ("POST",    Some(Method::Post)),
            ("OPTIONS", Some(Method::Options)),
            ("DELETE",  Some(Method::Delete)),
            ("get",     None),
            ("TRACE",   None),
            ("GETS",    None),
            ("",        None),
        ];

        for (src, result) in cases {
            assert_eq!(src.parse::<Method>().ok(), result, "{src:?}");
            if let Some(method) = result {
                assert_eq!(method.as_str(), src);
            }
        }
    }

    #[test]
    fn version() {
        assert_eq!(Version::from_bytes(b"HTTP/1.1"), Ok((Version::Http11, true)));
        assert_eq!(Version::from_bytes(b"HTTP/1.0"), Ok((Version::Http10, false)));
        assert_eq!(Version::from_bytes(b"HTTP/2.0"), Err(ErrorKind::UnsupportedVersion));
        assert_eq!(Version::from_bytes(b"FTP/1.0"), Err(ErrorKind::InvalidVersion));
    }

    #[test]
    fn status_code() {
        #[rustfmt::skip]
        let cases = [
            (StatusCode::Ok,                  200, "200 OK",                    false),
            (StatusCode::Found,               302, "302 Found",                 false),
            (StatusCode::MovedPermanently,    301, "301 Moved Permanently",     false),
            (StatusCode::Unauthorized,        401, "401 Unauthorized",          true),
            (StatusCode::NotFound,            404, "404 Not Found",             true),
            (StatusCode::InternalServerError, 500, "500 Internal Server Error", true),
        ];

        for (status, code, line, is_error) in cases {
            assert_eq!(status.as_u16(), code);
            assert_eq!(status.status_line(), line);
            assert_eq!(status.to_string(), line);
            assert_eq!(status.is_error(), is_error);
            assert_eq!(StatusCode::from_u16(code), Some(status));
        }

        assert_eq!(
            StatusCode::NotFound.into_first_line(Version::Http11),
            b"HTTP/1.1 404 Not Found\r\n"
        );
        assert_eq!(StatusCode::from_u16(299), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(slice_to_usize(b"0"), Some(0));
        assert_eq!(slice_to_usize(b"10000000"), Some(10_000_000));
        assert_eq!(slice_to_usize(b""), None);
        assert_eq!(slice_to_usize(b"-1"), None);
        assert_eq!(slice_to_usize(b"99999999999999999999999"), None);
    }
}
