use crate::Version;
use std::{error, fmt, io};

/// Errors raised by the framework core.
///
/// Client data problems (malformed JSON, missing keys, tampered cookies) never
/// show up here: they are answered with a refusal [`Response`](crate::Response)
/// before they reach the [`Dispatcher`](crate::Dispatcher). Everything in this
/// enum is caught once, at the dispatcher boundary, where the transaction is
/// rolled back and a fallback reply is produced.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The declared request body is larger than the in-memory buffer.
    #[error("can't load {length} bytes into memory, the limit is {limit}")]
    PayloadTooLarge { length: usize, limit: usize },

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    /// Framework misuse, e.g. a relative location passed to
    /// [`Response::redirect`](crate::Response::redirect).
    #[error("{0}")]
    Contract(String),

    /// A handler asked to check routes it never registered.
    #[error("route configuration: {0}")]
    RouteConfig(String),

    #[error("store: {0}")]
    Store(String),

    #[error("template: {0}")]
    Template(String),

    #[error("missing config value: {0}")]
    MissingConfig(&'static str),

    #[error("config format: {0}")]
    ConfigFormat(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Pattern(#[from] regex::Error),

    /// Failure raised by application code inside a handler.
    #[error(transparent)]
    Handler(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    #[inline]
    pub fn contract<M: Into<String>>(message: M) -> Self {
        Error::Contract(message.into())
    }

    #[inline]
    pub fn store<M: fmt::Display>(message: M) -> Self {
        Error::Store(message.to_string())
    }

    /// Wraps any application error so it can travel out of a handler.
    #[inline]
    pub fn handler<E: Into<Box<dyn error::Error + Send + Sync>>>(err: E) -> Self {
        Error::Handler(err.into())
    }
}

// Wire level

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    InvalidUrl,

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    InvalidEncoding,
    TooManyHeaders,
    HeadTooLarge,
    InvalidContentLength,
    UnsupportedTransferEncoding,

    InternalError,
    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        InvalidEncoding: "400 Bad Request", "58"
            => r#"{"error":"Request is not UTF-8","code":"INVALID_ENCODING"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeadTooLarge: "431 Request Header Fields Too Large", "58"
            => r#"{"error":"Request head too large","code":"HEAD_TOO_LARGE"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        UnsupportedTransferEncoding: "501 Not Implemented", "82"
            => r#"{"error":"Transfer-Encoding not supported","code":"UNSUPPORTED_TRANSFER_ENCODING"}"#;

        InternalError: "500 Internal Server Error", "57"
            => r#"{"error":"Internal server error","code":"INTERNAL_ERROR"}"#;
        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_lengths_match_bodies() {
        let cases = [
            ErrorKind::InvalidMethod,
            ErrorKind::InvalidUrl,
            ErrorKind::InvalidVersion,
            ErrorKind::UnsupportedVersion,
            ErrorKind::InvalidHeader,
            ErrorKind::InvalidEncoding,
            ErrorKind::TooManyHeaders,
            ErrorKind::HeadTooLarge,
            ErrorKind::InvalidContentLength,
            ErrorKind::UnsupportedTransferEncoding,
            ErrorKind::InternalError,
            ErrorKind::ServiceUnavailable,
        ];

        for kind in cases {
            let raw = std::str::from_utf8(kind.as_http(Version::Http11, true)).unwrap();
            let (head, body) = raw.split_once("\r\n\r\n").unwrap();
            let declared = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length: "))
                .unwrap();

            assert_eq!(declared.parse::<usize>().unwrap(), body.len(), "{kind:?}");
        }
    }

    #[test]
    fn plain_errors_have_no_body() {
        let raw = ErrorKind::TooManyHeaders.as_http(Version::Http10, false);
        assert_eq!(
            raw,
            b"HTTP/1.0 431 Request Header Fields Too Large\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        );
    }

    #[test]
    fn display() {
        let err = Error::PayloadTooLarge {
            length: 11,
            limit: 10,
        };
        assert_eq!(err.to_string(), "can't load 11 bytes into memory, the limit is 10");
        assert_eq!(Error::contract("nope").to_string(), "nope");
    }
}
