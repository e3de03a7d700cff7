//! `Cookie` header parsing and `Set-Cookie` construction.

use chrono::{DateTime, Duration, Utc};
use memchr::memchr;
use percent_encoding::percent_decode_str;
use std::{collections::BTreeMap, fmt};

/// Name of the cookie carrying the opaque session token.
pub const SESSION_TOKEN: &str = "session_uuid";
/// Name of the cookie carrying `HMAC(secret, session token)`.
pub const SESSION_HEXDIGEST: &str = "session_hexdigest";
/// Post-login redirect target.
pub const REDIRECT_TO: &str = "redirect-to";
/// One-shot banner message (`quote_plus` encoded).
pub const NEWS_MESSAGE: &str = "news-message";
pub const NEWS_MESSAGE_HEXDIGEST: &str = "news-message-hexdigest";

/// Cookie date format from RFC 1123, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const EXPIRES_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Parses a `Cookie` header into a name -> value map.
///
/// Pairs without `=` are ignored. The first occurrence of a name wins, as
/// browsers send the most specific path first. Double-quoted values are
/// unquoted.
///
/// ```
/// use paddock::cookie::parse;
///
/// let jar = parse(r#"session_uuid=abc; theme="dark"; flag; session_uuid=old"#);
/// assert_eq!(jar["session_uuid"], "abc");
/// assert_eq!(jar["theme"], "dark");
/// assert!(!jar.contains_key("flag"));
/// ```
pub fn parse(header: &str) -> BTreeMap<String, String> {
    let mut jar = BTreeMap::new();

    for pair in header.split(';') {
        let pair = pair.trim();
        let Some(index) = memchr(b'=', pair.as_bytes()) else {
            continue;
        };

        let name = pair[..index].trim();
        if name.is_empty() {
            continue;
        }

        let value = pair[index + 1..].trim();
        let value = match value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            true => &value[1..value.len() - 1],
            false => value,
        };

        jar.entry(name.to_owned()).or_insert_with(|| value.to_owned());
    }

    jar
}

/// Form-style encoding: spaces become `+`, reserved bytes become `%XX`.
#[inline]
pub fn quote_plus(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Inverse of [`quote_plus`]. Invalid UTF-8 is replaced, never rejected.
pub fn unquote_plus(value: &str) -> String {
    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[inline]
pub fn format_expires(when: DateTime<Utc>) -> String {
    when.format(EXPIRES_FORMAT).to_string()
}

/// Expiry date for cookies the browser should drop immediately.
#[inline]
pub fn two_weeks_ago() -> DateTime<Utc> {
    two_weeks_before(Utc::now())
}

#[inline]
pub fn two_weeks_before(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(14)
}

/// A single `Set-Cookie` header value.
///
/// ```
/// use paddock::cookie::SetCookie;
///
/// let cookie = SetCookie::new("news-message", "Welcome+back").http_only().path("/");
/// assert_eq!(cookie.to_string(), "news-message=Welcome+back; HttpOnly; Path=/");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    name: String,
    value: String,
    expires: Option<DateTime<Utc>>,
    path: Option<String>,
    http_only: bool,
}

impl SetCookie {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: None,
            path: None,
            http_only: false,
        }
    }

    #[inline]
    pub fn expires(mut self, when: DateTime<Utc>) -> Self {
        self.expires = Some(when);
        self
    }

    #[inline]
    pub fn path<P: Into<String>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    #[inline]
    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;

        if let Some(expires) = self.expires {
            write!(f, "; expires={}", format_expires(expires))?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }

        Ok(())
    }
}
