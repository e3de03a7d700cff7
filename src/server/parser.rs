use crate::{
    errors::ErrorKind,
    http::{
        request::{self, Environ},
        types::{slice_to_usize, Method, Version},
    },
    limits::ReqLimits,
};
use memchr::{memchr, memchr_iter};
use std::{io::Read, net::SocketAddr};

/// A parsed request head, everything up to and including the blank line.
#[derive(Debug, PartialEq)]
pub(crate) struct Head {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query_string: String,
    pub(crate) version: Version,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) content_length: Option<usize>,
    pub(crate) keep_alive: bool,
}

impl Head {
    pub(crate) fn into_environ(
        self,
        input: Box<dyn Read + Send>,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Environ {
        let mut environ = Environ::new(self.method, self.path)
            .query(self.query_string)
            .remote_addr(peer.ip().to_string())
            .input(input);

        if let Some(local) = local {
            environ = environ.server_name(local.ip().to_string());
        }

        self.headers
            .into_iter()
            .fold(environ, |environ, (name, value)| environ.header(name, value))
    }
}

/// Parses `src`, which must end with `\r\n\r\n`.
pub(crate) fn parse_head(src: &[u8], limits: &ReqLimits) -> Result<Head, ErrorKind> {
    if src.len() > limits.head_size {
        return Err(ErrorKind::HeadTooLarge);
    }

    let text = simdutf8::basic::from_utf8(src).map_err(|_| ErrorKind::InvalidEncoding)?;
    let mut lines = memchr_iter(b'\n', src);

    // First line
    let first_end = lines.next().ok_or(ErrorKind::InvalidVersion)?;
    let first_line = crlf_line(text, 0, first_end).ok_or(ErrorKind::InvalidVersion)?;

    let (method, method_len) = Method::from_bytes(first_line.as_bytes())?;
    let rest = &first_line[method_len..];

    let target_end = memchr(b' ', rest.as_bytes()).ok_or(ErrorKind::InvalidVersion)?;
    let (path, query_string) = split_target(&rest[..target_end])?;
    let path = request::decode_path(path).ok_or(ErrorKind::InvalidUrl)?;
    let (version, mut keep_alive) = Version::from_bytes(rest[target_end + 1..].as_bytes())?;

    // Headers
    let mut headers = Vec::new();
    let mut content_length = None;
    let mut start = first_end + 1;

    for end in lines {
        let line = crlf_line(text, start, end).ok_or(ErrorKind::InvalidHeader)?;
        start = end + 1;

        if line.is_empty() {
            break;
        }
        if headers.len() >= limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let colon = memchr(b':', line.as_bytes()).ok_or(ErrorKind::InvalidHeader)?;
        let name = &line[..colon];
        let value = line[colon + 1..].trim();

        if name.is_empty() || name.bytes().any(|byte| byte.is_ascii_whitespace()) {
            return Err(ErrorKind::InvalidHeader);
        }

        if name.eq_ignore_ascii_case("content-length") {
            let len = slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?;
            if content_length.is_some_and(|known| known != len) {
                return Err(ErrorKind::InvalidContentLength);
            }
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(ErrorKind::UnsupportedTransferEncoding);
        } else if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("close") {
                keep_alive = false;
            } else if value.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }

        headers.push((name.to_owned(), value.to_owned()));
    }

    Ok(Head {
        method,
        path,
        query_string: query_string.to_owned(),
        version,
        headers,
        content_length,
        keep_alive,
    })
}

// The line between `start` and the `\n` at `end`, which must follow a `\r`.
#[inline]
fn crlf_line(text: &str, start: usize, end: usize) -> Option<&str> {
    text.get(start..end)?.strip_suffix('\r')
}

#[inline]
fn split_target(target: &str) -> Result<(&str, &str), ErrorKind> {
    if !target.starts_with('/') {
        return Err(ErrorKind::InvalidUrl);
    }

    Ok(match memchr(b'?', target.as_bytes()) {
        Some(index) => (&target[..index], &target[index + 1..]),
        None => (target, ""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Head, ErrorKind> {
        parse_head(src.as_bytes(), &ReqLimits::default())
    }

    #[test]
    fn valid_heads() {
        let head = parse(
            "POST /notes/7?tab=files&x= HTTP/1.1\r\n\
             Host: example.com\r\n\
             Content-Type: application/json\r\n\
             Content-Length:  12 \r\n\
             \r\n",
        )
        .unwrap();

        assert_eq!(head.method, Method::Post);
        assert_eq!(head.path, "/notes/7");
        assert_eq!(head.query_string, "tab=files&x=");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.content_length, Some(12));
        assert!(head.keep_alive);
        assert_eq!(head.headers[0], ("Host".to_owned(), "example.com".to_owned()));
        assert_eq!(head.headers.len(), 3);

        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.0\r\n\r\n",                                false),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",      true),
            ("GET / HTTP/1.1\r\nconnection: Close\r\n\r\n",           false),
            ("GET / HTTP/1.1\r\nConnection: upgrade\r\n\r\n",         true),
        ];

        for (src, keep_alive) in cases {
            assert_eq!(parse(src).unwrap().keep_alive, keep_alive, "{src:?}");
        }
    }

    #[test]
    fn invalid_heads() {
        #[rustfmt::skip]
        let cases = [
            ("BREW / HTTP/1.1\r\n\r\n",                               ErrorKind::InvalidMethod),
            ("GET notes HTTP/1.1\r\n\r\n",                            ErrorKind::InvalidUrl),
            ("GET /%FF%FE HTTP/1.1\r\n\r\n",                          ErrorKind::InvalidUrl),
            ("GET / HTTP/2.0\r\n\r\n",                                ErrorKind::UnsupportedVersion),
            ("GET / FTP/1.0\r\n\r\n",                                 ErrorKind::InvalidVersion),
            ("GET /\r\n\r\n",                                         ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\n\r\n",                                  ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\r\nHost example.com\r\n\r\n",            ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",                 ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: x\r\n\r\n",                         ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n",         ErrorKind::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n", ErrorKind::InvalidContentLength),
            ("GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",  ErrorKind::UnsupportedTransferEncoding),
        ];

        for (src, err) in cases {
            assert_eq!(parse(src), Err(err), "{src:?}");
        }

        assert_eq!(
            parse_head(b"GET /\xff HTTP/1.1\r\n\r\n", &ReqLimits::default()),
            Err(ErrorKind::InvalidEncoding)
        );
    }

    #[test]
    fn limits() {
        let limits = ReqLimits {
            head_size: 64,
            header_count: 2,
            ..ReqLimits::default()
        };

        let src = "GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\n\r\n";
        assert!(parse_head(src.as_bytes(), &limits).is_ok());

        let src = "GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        assert_eq!(parse_head(src.as_bytes(), &limits), Err(ErrorKind::TooManyHeaders));

        let src = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(64));
        assert_eq!(parse_head(src.as_bytes(), &limits), Err(ErrorKind::HeadTooLarge));
    }

    #[test]
    fn environ() {
        let head = parse("GET /files?page=2 HTTP/1.1\r\nHost: example.com\r\nX-Thing: a\r\n\r\n").unwrap();
        let environ = head.into_environ(
            Box::new(std::io::empty()),
            "10.0.0.1:5000".parse().unwrap(),
            Some("127.0.0.1:8080".parse().unwrap()),
        );

        assert_eq!(environ.method(), Method::Get);
        assert_eq!(environ.path(), "/files");
        assert_eq!(environ.query_string(), "page=2");

        let head = parse("GET /shared%20files/r%C3%A9sum%C3%A9?q=a%20b HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.path, "/shared files/résumé");
        assert_eq!(head.query_string, "q=a%20b");
        assert_eq!(environ.get("host"), Some("example.com"));
        assert_eq!(environ.get("x-thing"), Some("a"));
    }
}
