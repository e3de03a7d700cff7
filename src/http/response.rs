//! Outgoing replies.

use crate::{
    config::Config,
    errors::Error,
    http::{
        cookie::{
            quote_plus, two_weeks_ago, SetCookie, NEWS_MESSAGE, NEWS_MESSAGE_HEXDIGEST,
            REDIRECT_TO, SESSION_HEXDIGEST, SESSION_TOKEN,
        },
        request::Request,
        types::StatusCode,
    },
    json, session,
    templates::Templates,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{fmt, io::Read};
use tracing::debug;

const SET_COOKIE: &str = "Set-Cookie";
const LOCATION: &str = "Location";
const NOCACHE: (&str, &str) = ("Cache-Control", "no-cache");

/// A status, an ordered header list and a body.
///
/// Duplicate headers are allowed (several `Set-Cookie` lines are normal).
/// The few headers that must appear once are added through idempotent
/// helpers such as [`add_nocache_header`](Response::add_nocache_header).
///
/// Build one with a named constructor and adjust it with the `&mut self`
/// methods:
///
/// ```
/// use paddock::{Response, StatusCode};
///
/// let mut resp = Response::html("<h1>Welcome</h1>");
/// resp.add_nocache_header()
///     .set_news_message_cookie("Signed in!", None);
///
/// assert_eq!(resp.status(), StatusCode::Ok);
/// assert_eq!(resp.header("content-type"), Some("text/html; charset=utf-8"));
/// assert_eq!(resp.header("set-cookie"), Some("news-message=Signed+in%21; HttpOnly; Path=/"));
/// ```
///
/// Handlers return `Result<Response, Error>`; a handler can't produce
/// anything else.
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Body,
}

/// Response payload.
pub enum Body {
    /// Fully buffered bytes.
    Bytes(Vec<u8>),
    /// Pulled by the transport in chunks and sent with chunked encoding.
    Stream(Box<dyn Read + Send>),
}

impl Body {
    #[inline]
    pub fn empty() -> Self {
        Body::Bytes(Vec::new())
    }

    /// Buffered bytes, `None` for a stream.
    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Body::Bytes(bytes.to_vec())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Bytes(text.into_bytes())
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Bytes(text.as_bytes().to_vec())
    }
}

// Already split into parts
impl From<Vec<String>> for Body {
    fn from(parts: Vec<String>) -> Self {
        Body::Bytes(parts.concat().into_bytes())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(bytes) => f
                .debug_tuple("Bytes")
                .field(&String::from_utf8_lossy(bytes))
                .finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Status of a [`Response::json`] reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonStatus {
    #[default]
    Ok,
    BadRequest,
    NotFound,
    InternalServerError,
}

impl From<JsonStatus> for StatusCode {
    fn from(status: JsonStatus) -> Self {
        match status {
            JsonStatus::Ok => StatusCode::Ok,
            JsonStatus::BadRequest => StatusCode::BadRequest,
            JsonStatus::NotFound => StatusCode::NotFound,
            JsonStatus::InternalServerError => StatusCode::InternalServerError,
        }
    }
}

// Constructors
impl Response {
    pub fn new<B: Into<Body>>(status: StatusCode, headers: Vec<(String, String)>, body: B) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    #[inline]
    fn with_content_type<B: Into<Body>>(content_type: &str, body: B) -> Self {
        Self::new(
            StatusCode::Ok,
            vec![("Content-Type".to_owned(), content_type.to_owned())],
            body,
        )
    }

    /// `200 OK`, `text/html; charset=utf-8`.
    #[inline]
    pub fn html<B: Into<Body>>(body: B) -> Self {
        Self::with_content_type("text/html; charset=utf-8", body)
    }

    /// `200 OK`, `text/plain`. Text is sent as UTF-8.
    ///
    /// ```
    /// let resp = paddock::Response::plain("Jalapeño");
    /// assert_eq!(resp.body().as_bytes(), Some("Jalapeño".as_bytes()));
    /// ```
    #[inline]
    pub fn plain<B: Into<Body>>(body: B) -> Self {
        Self::with_content_type("text/plain", body)
    }

    #[inline]
    pub fn css<B: Into<Body>>(body: B) -> Self {
        Self::with_content_type("text/css", body)
    }

    #[inline]
    pub fn csv<B: Into<Body>>(body: B) -> Self {
        Self::with_content_type("text/csv", body)
    }

    /// A CSV reply read from `source` while it is being sent, never buffered
    /// as a whole.
    pub fn csv_stream<R: Read + Send + 'static>(source: R) -> Self {
        Self::with_content_type("text/csv", Body::Stream(Box::new(source)))
    }

    /// Pretty-printed `Debug` output as plain text.
    pub fn pformat<T: fmt::Debug + ?Sized>(value: &T) -> Self {
        Self::plain(format!("{value:#?}"))
    }

    /// Serializes `data` with the [`json`] encoder.
    ///
    /// ```
    /// use paddock::{JsonStatus, Response, StatusCode};
    /// use serde_json::json;
    ///
    /// let resp = Response::json(&json!({"success": false}), JsonStatus::NotFound).unwrap();
    /// assert_eq!(resp.status().status_line(), "404 Not Found");
    /// assert_eq!(resp.body().as_bytes(), Some(&br#"{"success":false}"#[..]));
    /// ```
    pub fn json<T: Serialize + ?Sized>(data: &T, status: JsonStatus) -> Result<Self, Error> {
        let mut resp = Self::with_content_type("application/json", json::encode(data)?);
        resp.status = status.into();
        Ok(resp)
    }

    /// `302 Found` to an absolute location.
    ///
    /// Relative locations are refused: some browsers append them to the
    /// current path. Use [`relative_redirect`](Response::relative_redirect)
    /// for in-app paths.
    ///
    /// ```
    /// use paddock::{Response, StatusCode};
    ///
    /// let resp = Response::redirect("http://example.com/fibityfoo").unwrap();
    /// assert_eq!(resp.status(), StatusCode::Found);
    /// assert!(Response::redirect("/fibityfoo").is_err());
    /// ```
    pub fn redirect(location: &str) -> Result<Self, Error> {
        if !location.starts_with("http") {
            return Err(Error::contract(format!(
                "{location} is a relative redirect! Use relative_redirect for in-app redirects"
            )));
        }

        Ok(Self::location(StatusCode::Found, location))
    }

    /// `302 Found` to `scheme://host` + `path`, taken from the config.
    pub fn relative_redirect(config: &Config, path: &str) -> Result<Self, Error> {
        if path.starts_with("http") {
            return Err(Error::contract(format!(
                "{path} is absolute, use Response::redirect for it"
            )));
        }

        Ok(Self::location(
            StatusCode::Found,
            &config.make_location_from_path(path),
        ))
    }

    /// `301 Moved Permanently`.
    #[inline]
    pub fn permanent_redirect(location: &str) -> Self {
        Self::location(StatusCode::MovedPermanently, location)
    }

    #[inline]
    fn location(status: StatusCode, location: &str) -> Self {
        Self::new(
            status,
            vec![(LOCATION.to_owned(), location.to_owned())],
            Body::empty(),
        )
    }

    /// Redirects to the request's `redirect-to` cookie and expires it.
    pub fn redirect_from_cookie(req: &mut Request<'_>) -> Result<Self, Error> {
        let location = req
            .redirect_cookie()
            .ok_or_else(|| Error::contract("the request has no redirect-to cookie"))?;

        let mut resp = Self::redirect(&location)?;
        resp.expire_redirect_cookie()?;
        Ok(resp)
    }

    /// Renders `name` and replies with it as HTML.
    pub fn template(templates: &dyn Templates, name: &str, context: &Value) -> Result<Self, Error> {
        debug!(template = name, "rendering template...");
        Ok(Self::html(templates.render(name, context)?))
    }

    /// [`template`](Response::template) with the request's templates.
    #[inline]
    pub fn tmpl(req: &Request<'_>, name: &str, context: &Value) -> Result<Self, Error> {
        Self::template(req.templates(), name, context)
    }
}

// Accessors
impl Response {
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    #[inline]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[inline]
    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Appends a header; duplicates are kept.
    pub fn add_header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    #[inline]
    pub fn into_parts(self) -> (StatusCode, Vec<(String, String)>, Body) {
        (self.status, self.headers, self.body)
    }

    fn set_cookies(&self) -> impl Iterator<Item = (usize, &str)> {
        self.headers
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| name.eq_ignore_ascii_case(SET_COOKIE))
            .map(|(index, (_, value))| (index, value.as_str()))
    }

    fn add_cookie(&mut self, cookie: SetCookie) -> &mut Self {
        self.add_header(SET_COOKIE, cookie.to_string())
    }
}

// Headers
impl Response {
    /// Adds `Cache-Control: no-cache` unless it is already there.
    pub fn add_nocache_header(&mut self) -> &mut Self {
        if !self.is_nocache() {
            self.add_header(NOCACHE.0, NOCACHE.1);
        }
        self
    }

    /// Removes every `Cache-Control: no-cache` header.
    pub fn remove_nocache_header(&mut self) -> &mut Self {
        self.headers
            .retain(|(name, value)| !(name == NOCACHE.0 && value == NOCACHE.1));
        self
    }

    fn is_nocache(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, value)| name == NOCACHE.0 && value == NOCACHE.1)
    }
}

// Cookies
impl Response {
    /// The pending `redirect-to=...` cookie header, if this response sets one.
    pub fn redirect_cookie(&self) -> Option<&str> {
        self.set_cookies()
            .map(|(_, value)| value)
            .find(|value| value.starts_with(REDIRECT_TO))
    }

    /// Stores a post-login target, `quote_plus` encoded, replacing any
    /// earlier one.
    ///
    /// ```
    /// let mut resp = paddock::Response::plain("");
    /// resp.set_redirect_cookie("http://example.com/a")
    ///     .set_redirect_cookie("http://example.com/b");
    ///
    /// assert_eq!(resp.redirect_cookie(), Some("redirect-to=http%3A%2F%2Fexample.com%2Fb"));
    /// assert_eq!(resp.headers().len(), 2);
    /// ```
    pub fn set_redirect_cookie(&mut self, location: &str) -> &mut Self {
        self.remove_redirect_cookie_header();
        self.add_cookie(SetCookie::new(REDIRECT_TO, quote_plus(location)))
    }

    /// [`set_redirect_cookie`](Response::set_redirect_cookie) for an in-app path.
    pub fn set_relative_redirect_cookie(&mut self, config: &Config, path: &str) -> &mut Self {
        self.set_redirect_cookie(&config.make_location_from_path(path))
    }

    /// Drops a pending `redirect-to` header from this response.
    ///
    /// This doesn't touch the browser's cookie, see
    /// [`expire_redirect_cookie`](Response::expire_redirect_cookie) for that.
    pub fn remove_redirect_cookie_header(&mut self) -> &mut Self {
        let found = self
            .set_cookies()
            .find(|(_, value)| value.starts_with(REDIRECT_TO))
            .map(|(index, _)| index);

        if let Some(index) = found {
            self.headers.remove(index);
        }
        self
    }

    /// Tells the browser to forget its `redirect-to` cookie.
    ///
    /// Fails if this same response also sets one.
    pub fn expire_redirect_cookie(&mut self) -> Result<&mut Self, Error> {
        if self.redirect_cookie().is_some() {
            return Err(Error::contract(
                "first you set a redirect cookie, now you're expiring it? Make up your mind",
            ));
        }

        Ok(self.add_cookie(SetCookie::new(REDIRECT_TO, "expired").expires(two_weeks_ago())))
    }

    /// Sets the one-shot banner message, optionally signed with
    /// `HMAC(secret, quoted message)`.
    pub fn set_news_message_cookie(&mut self, message: &str, hmac_secret: Option<&str>) -> &mut Self {
        let quoted = quote_plus(message);

        if let Some(secret) = hmac_secret {
            let digest = session::sign(secret, &quoted);
            self.add_cookie(SetCookie::new(NEWS_MESSAGE, quoted).http_only().path("/"));
            self.add_cookie(SetCookie::new(NEWS_MESSAGE_HEXDIGEST, digest).http_only().path("/"))
        } else {
            self.add_cookie(SetCookie::new(NEWS_MESSAGE, quoted).http_only().path("/"))
        }
    }

    pub fn mark_news_message_as_expired(&mut self) -> &mut Self {
        self.add_cookie(
            SetCookie::new(NEWS_MESSAGE, "Sorry")
                .expires(two_weeks_ago())
                .http_only()
                .path("/"),
        )
    }

    /// Tells the browser to forget the digest of a signed news message.
    ///
    /// A digest left behind would reject the next unsigned message.
    pub fn expire_news_message_hexdigest(&mut self) -> &mut Self {
        self.add_cookie(
            SetCookie::new(NEWS_MESSAGE_HEXDIGEST, "expired")
                .expires(two_weeks_ago())
                .http_only()
                .path("/"),
        )
    }

    /// Writes the session token and its digest as two cookies with the same
    /// path and expiry.
    pub fn set_session_cookie(
        &mut self,
        token: &str,
        secret: &str,
        expires: DateTime<Utc>,
        path: &str,
    ) -> &mut Self {
        let digest = session::sign(secret, token);

        self.add_cookie(SetCookie::new(SESSION_TOKEN, token).expires(expires).path(path));
        self.add_cookie(SetCookie::new(SESSION_HEXDIGEST, digest).expires(expires).path(path))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{test_config, Fixture};
    use crate::Environ;
    use std::io::Cursor;

    fn cookies(resp: &Response) -> Vec<&str> {
        resp.set_cookies().map(|(_, value)| value).collect()
    }

    #[test]
    fn content_types() {
        #[rustfmt::skip]
        let cases = [
            (Response::html("x"),  "text/html; charset=utf-8"),
            (Response::plain("x"), "text/plain"),
            (Response::css("x"),   "text/css"),
            (Response::csv("x"),   "text/csv"),
        ];

        for (resp, content_type) in cases {
            assert_eq!(resp.status(), StatusCode::Ok);
            assert_eq!(resp.header("Content-Type"), Some(content_type));
            assert_eq!(resp.body().as_bytes(), Some(&b"x"[..]));
        }
    }

    #[test]
    fn bodies() {
        let parts = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(Response::plain(parts).body().as_bytes(), Some(&b"ab"[..]));
        assert_eq!(Response::plain(vec![1u8, 2]).body().as_bytes(), Some(&[1u8, 2][..]));

        let resp = Response::csv_stream(Cursor::new(b"a,b\n1,2\n".to_vec()));
        assert_eq!(resp.header("content-type"), Some("text/csv"));
        assert!(resp.body().as_bytes().is_none());

        let resp = Response::pformat(&vec![1, 2]);
        let text = String::from_utf8(resp.body().as_bytes().unwrap().to_vec()).unwrap();
        assert_eq!(text, "[\n    1,\n    2,\n]");
    }

    #[test]
    fn json_statuses() {
        #[rustfmt::skip]
        let cases = [
            (JsonStatus::Ok,                  "200 OK"),
            (JsonStatus::BadRequest,          "400 Bad Request"),
            (JsonStatus::NotFound,            "404 Not Found"),
            (JsonStatus::InternalServerError, "500 Internal Server Error"),
        ];

        for (status, line) in cases {
            let resp = Response::json(&serde_json::json!({"a": [1]}), status).unwrap();

            assert_eq!(resp.status().status_line(), line);
            assert_eq!(resp.header("content-type"), Some("application/json"));
            assert_eq!(resp.body().as_bytes(), Some(&br#"{"a":[1]}"#[..]));
        }
    }

    #[test]
    fn redirect_direction() {
        let config = test_config();

        assert!(matches!(Response::redirect("/relative"), Err(Error::Contract(_))));
        assert!(matches!(
            Response::relative_redirect(&config, "http://x"),
            Err(Error::Contract(_))
        ));

        let resp = Response::redirect("http://example.com/x").unwrap();
        assert_eq!(resp.status(), StatusCode::Found);
        assert_eq!(resp.header("location"), Some("http://example.com/x"));

        let resp = Response::relative_redirect(&config, "/login").unwrap();
        assert_eq!(resp.status().as_u16(), 302);
        assert_eq!(resp.header("location"), Some("http://example.com/login"));

        let resp = Response::permanent_redirect("/moved");
        assert_eq!(resp.status().status_line(), "301 Moved Permanently");
    }

    #[test]
    fn nocache_is_idempotent() {
        let mut resp = Response::plain("");
        resp.add_nocache_header().add_nocache_header();
        assert_eq!(resp.headers().len(), 2);
        assert!(resp.has_header("cache-control"));

        resp.add_header("Cache-Control", "no-cache");
        resp.remove_nocache_header();
        assert!(!resp.has_header("cache-control"));
        assert_eq!(resp.headers().len(), 1);
    }

    #[test]
    fn redirect_cookie_lifecycle() {
        let config = test_config();
        let mut resp = Response::plain("");

        resp.set_relative_redirect_cookie(&config, "/my-account");
        assert_eq!(resp.redirect_cookie(), Some("redirect-to=http%3A%2F%2Fexample.com%2Fmy-account"));
        assert!(resp.expire_redirect_cookie().is_err());

        resp.remove_redirect_cookie_header();
        assert_eq!(resp.redirect_cookie(), None);

        resp.expire_redirect_cookie().unwrap();
        let expired = cookies(&resp);
        assert_eq!(expired.len(), 1);
        assert!(expired[0].starts_with("redirect-to=expired; expires="));
        assert!(expired[0].ends_with(" GMT"));
    }

    #[test]
    fn redirect_from_cookie() {
        let mut fixture = Fixture::new();
        let environ = Environ::new(crate::Method::Get, "/login")
            .header("cookie", "redirect-to=http://example.com/my-account");
        let mut req = fixture.request(environ);

        let resp = Response::redirect_from_cookie(&mut req).unwrap();
        assert_eq!(resp.header("location"), Some("http://example.com/my-account"));
        assert!(cookies(&resp)[0].starts_with("redirect-to=expired"));

        let mut fixture = Fixture::new();
        let mut req = fixture.request(Environ::new(crate::Method::Get, "/login"));
        assert!(Response::redirect_from_cookie(&mut req).is_err());
    }

    #[test]
    fn redirect_cookie_survives_the_cookie_header() {
        let target = "http://example.com/files?page=2&q=a;b c";
        let mut resp = Response::plain("");
        resp.set_redirect_cookie(target);

        let set_cookie = resp.redirect_cookie().unwrap();
        assert!(!set_cookie.contains(|c: char| matches!(c, ';' | ' ' | ',' | '"')), "{set_cookie}");

        let mut fixture = Fixture::new();
        let environ = Environ::new(crate::Method::Get, "/login").header("cookie", format!("a=1; {set_cookie}; b=2"));
        let mut req = fixture.request(environ);

        assert_eq!(req.redirect_cookie().as_deref(), Some(target));
        let resp = Response::redirect_from_cookie(&mut req).unwrap();
        assert_eq!(resp.header("location"), Some(target));
    }

    #[test]
    fn news_message_cookies() {
        let mut resp = Response::plain("");
        resp.set_news_message_cookie("Hi there", Some("secret"));

        assert_eq!(
            cookies(&resp),
            [
                "news-message=Hi+there; HttpOnly; Path=/".to_owned(),
                format!(
                    "news-message-hexdigest={}; HttpOnly; Path=/",
                    session::sign("secret", "Hi+there")
                ),
            ]
        );

        let mut resp = Response::plain("");
        resp.mark_news_message_as_expired().expire_news_message_hexdigest();
        let expired = cookies(&resp);
        assert_eq!(expired.len(), 2);
        assert!(expired[0].starts_with("news-message=Sorry; expires="));
        assert!(expired[0].ends_with("GMT; HttpOnly; Path=/"));
        assert!(expired[1].starts_with("news-message-hexdigest=expired; expires="));
        assert!(expired[1].ends_with("GMT; HttpOnly; Path=/"));
    }

    #[test]
    fn session_cookie_pair() {
        let expires = Utc::now();
        let mut resp = Response::plain("");
        resp.set_session_cookie("tok", "secret", expires, "/app");

        let set = cookies(&resp);
        let suffix = format!("; expires={}; Path=/app", crate::cookie::format_expires(expires));
        assert_eq!(set.len(), 2);
        assert_eq!(set[0], format!("session_uuid=tok{suffix}"));
        assert_eq!(
            set[1],
            format!("session_hexdigest={}{suffix}", session::sign("secret", "tok"))
        );
    }

    #[test]
    fn templates() {
        let mut fixture = Fixture::new();
        let req = fixture.request(Environ::new(crate::Method::Get, "/"));

        let resp = Response::tmpl(&req, crate::templates::NOT_FOUND_TEMPLATE, &Value::Null).unwrap();
        assert_eq!(resp.header("content-type"), Some("text/html; charset=utf-8"));
        assert!(Response::tmpl(&req, "missing.html", &Value::Null).is_err());
    }
}
