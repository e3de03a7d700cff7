use crate::{
    config::Config,
    errors::Error,
    http::{
        cookie::{self, NEWS_MESSAGE, NEWS_MESSAGE_HEXDIGEST, REDIRECT_TO},
        multipart::{self, Files, Multipart},
        query::{Charset, Params, Query},
        route::LineOne,
        types::{slice_to_usize, Method},
    },
    session::{self, Session, SessionState, User},
    store::Transaction,
    templates::Templates,
};
use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    io::{self, Cursor, Read},
};
use tracing::{debug, warn};

/// Most parameters accepted from one query string or form body.
const PARAMETER_LIMIT: usize = 1024;

/// Path bytes kept as they are when a path goes back into a URL.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Transport-level data for one exchange.
///
/// The built-in [`Server`](crate::Server) produces one per request; tests and
/// other front ends build them by hand. The path is stored percent-decoded,
/// the query string as it arrived.
///
/// # Examples
/// ```
/// use paddock::{Environ, Method};
///
/// let environ = Environ::from_line_one("POST /login?next=%2Fhome")
///     .unwrap()
///     .header("Content-Type", "application/x-www-form-urlencoded")
///     .body("email=a%40example.com&password=x");
///
/// assert_eq!(environ.method(), Method::Post);
/// assert_eq!(environ.path(), "/login");
/// assert_eq!(environ.query_string(), "next=%2Fhome");
/// assert_eq!(environ.get("content-length"), Some("32"));
/// ```
pub struct Environ {
    method: Method,
    path: String,
    query_string: String,
    /// Names are stored lowercased.
    headers: Vec<(String, String)>,
    scheme: String,
    server_name: String,
    remote_addr: Option<String>,
    input: Box<dyn Read + Send>,
}

impl Environ {
    pub fn new<P: Into<String>>(method: Method, path: P) -> Self {
        Self {
            method,
            path: path.into(),
            query_string: String::new(),
            headers: Vec::new(),
            scheme: "http".to_owned(),
            server_name: "localhost".to_owned(),
            remote_addr: None,
            input: Box::new(io::empty()),
        }
    }

    /// Builds an environ from a line like `"GET /products?page=2"`.
    pub fn from_line_one(line: &str) -> Result<Self, Error> {
        let (method, target) = line
            .trim()
            .split_once(' ')
            .ok_or_else(|| Error::contract(format!("{line:?} is not \"METHOD path\"")))?;

        let (path, query_string) = target.split_once('?').unwrap_or((target, ""));
        let path = decode_path(path).ok_or_else(|| Error::contract(format!("{path:?} is not valid UTF-8")))?;

        Ok(Self::new(method.parse()?, path).query(query_string))
    }

    /// Builds a `GET` environ from an absolute URL, setting scheme, server
    /// name and the `Host` header.
    ///
    /// ```
    /// let environ = paddock::Environ::from_url("https://example.com:8443/x?y=1").unwrap();
    ///
    /// assert_eq!(environ.scheme(), "https");
    /// assert_eq!(environ.get("host"), Some("example.com:8443"));
    /// assert_eq!(environ.path(), "/x");
    /// assert_eq!(environ.query_string(), "y=1");
    /// ```
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::contract(format!("{url:?} is not an absolute URL")))?;

        let (authority, target) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, "/"),
        };
        let (path, query_string) = target.split_once('?').unwrap_or((target, ""));
        let server_name = authority.split(':').next().unwrap_or(authority);
        let path = decode_path(path).ok_or_else(|| Error::contract(format!("{path:?} is not valid UTF-8")))?;

        let mut environ = Self::new(Method::Get, path)
            .query(query_string)
            .header("host", authority);
        environ.scheme = scheme.to_owned();
        environ.server_name = server_name.to_owned();

        Ok(environ)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn query<Q: Into<String>>(mut self, query_string: Q) -> Self {
        self.query_string = query_string.into();
        self
    }

    /// Appends a header. Names are case-insensitive.
    pub fn header<N: AsRef<str>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
        self
    }

    /// Sets an in-memory body and a matching `Content-Length`.
    pub fn body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        let body = body.into();

        self.headers.retain(|(name, _)| name != "content-length");
        self.headers
            .push(("content-length".to_owned(), body.len().to_string()));
        self.input = Box::new(Cursor::new(body));
        self
    }

    /// Sets the body stream without touching the headers.
    pub fn input<R: Read + Send + 'static>(mut self, input: R) -> Self {
        self.input = Box::new(input);
        self
    }

    pub fn with_scheme<S: Into<String>>(mut self, scheme: S) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn remote_addr<A: Into<String>>(mut self, addr: A) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

// Public API
impl Environ {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    #[inline]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// First header with this name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[inline]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl fmt::Debug for Environ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("headers", &self.headers)
            .field("scheme", &self.scheme)
            .field("server_name", &self.server_name)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// One inbound exchange, as seen by handlers.
///
/// Every derived value (parsed query, body, JSON, cookies, session, user) is
/// computed on first use and kept for the rest of the exchange. The body is
/// read from the transport at most once.
///
/// Malformed client data never fails a call: a body that isn't form data
/// parses to an empty map, a body that isn't JSON gives `None`, a bad session
/// signature gives no session. Errors are reserved for real failures, like a
/// body larger than [`maximum_buffer_size`](Request::maximum_buffer_size) or
/// a store that can't be reached.
pub struct Request<'a> {
    environ: Environ,
    config: &'a Config,
    templates: &'a dyn Templates,
    tx: &'a mut dyn Transaction,

    maximum_buffer_size: usize,
    route_params: BTreeMap<String, String>,

    parsed_query: Option<Params>,
    content_length: Option<Option<usize>>,
    body: Option<Option<Vec<u8>>>,
    parsed_body: Option<Params>,
    multipart: Option<Multipart>,
    json: Option<Option<Value>>,
    cookies: Option<BTreeMap<String, String>>,
    session: Option<SessionState>,
    user: Option<Option<User>>,
    news_message: Option<Option<String>>,
    news_message_popped: bool,
}

impl<'a> Request<'a> {
    pub fn new(
        environ: Environ,
        config: &'a Config,
        templates: &'a dyn Templates,
        tx: &'a mut dyn Transaction,
    ) -> Self {
        Self {
            environ,
            config,
            templates,
            tx,

            maximum_buffer_size: config.maximum_buffer_size(),
            route_params: BTreeMap::new(),

            parsed_query: None,
            content_length: None,
            body: None,
            parsed_body: None,
            multipart: None,
            json: None,
            cookies: None,
            session: None,
            user: None,
            news_message: None,
            news_message_popped: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &'a Config {
        self.config
    }

    #[inline]
    pub fn templates(&self) -> &'a dyn Templates {
        self.templates
    }

    /// The transaction this exchange runs in. Handler writes made through it
    /// commit or roll back together with the framework's own.
    #[inline]
    pub fn transaction(&mut self) -> &mut dyn Transaction {
        &mut *self.tx
    }

    #[inline]
    pub fn environ(&self) -> &Environ {
        &self.environ
    }
}

// Transport data
impl Request<'_> {
    #[inline]
    pub fn method(&self) -> Method {
        self.environ.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.environ.path
    }

    #[inline]
    pub fn query_string(&self) -> &str {
        &self.environ.query_string
    }

    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.environ.get(name)
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// The `charset` parameter of the content type, `UTF-8` by default.
    pub fn charset(&self) -> &str {
        self.content_type()
            .and_then(|value| {
                value.split(';').skip(1).find_map(|param| {
                    let (key, value) = param.split_once('=')?;
                    key.trim()
                        .eq_ignore_ascii_case("charset")
                        .then(|| value.trim().trim_matches('"'))
                })
            })
            .unwrap_or("UTF-8")
    }

    #[inline]
    pub fn is_get(&self) -> bool {
        self.method() == Method::Get
    }

    #[inline]
    pub fn is_post(&self) -> bool {
        self.method() == Method::Post
    }

    /// `true` when the content type mentions JSON.
    pub fn is_json(&self) -> bool {
        self.content_type()
            .map_or(false, |value| value.to_ascii_lowercase().contains("json"))
    }

    #[inline]
    pub fn is_ajax(&self) -> bool {
        self.header("x-requested-with") == Some("XMLHttpRequest")
    }

    /// `"METHOD path"`, the string routes are matched against.
    #[inline]
    pub fn line_one(&self) -> LineOne {
        LineOne::new(format!("{} {}", self.environ.method, self.environ.path))
    }

    /// The client, preferring `X-Forwarded-For` over the peer address.
    pub fn client_address(&self) -> Option<&str> {
        self.header("x-forwarded-for")
            .or(self.environ.remote_addr.as_deref())
            .map(str::trim)
    }

    /// `X-Forwarded-Host`, then `Host`, then the server name.
    pub fn host(&self) -> &str {
        self.header("x-forwarded-host")
            .or_else(|| self.header("host"))
            .unwrap_or(&self.environ.server_name)
    }

    /// Best guess at what the browser shows in its address bar.
    pub fn address_bar(&self) -> String {
        format!("{}://{}{}", self.environ.scheme, self.host(), self.path_and_qs())
    }

    /// The path, percent-encoded again, and the raw query string.
    pub fn path_and_qs(&self) -> String {
        let path = utf8_percent_encode(self.path(), PATH_SAFE);

        match self.query_string() {
            "" => path.to_string(),
            qs => format!("{path}?{qs}"),
        }
    }
}

// Parsed data
impl Request<'_> {
    /// Query parameters; multi-valued keys keep every value.
    pub fn parsed_query(&mut self) -> &Params {
        if self.parsed_query.is_none() {
            let parsed = decode_params(self.environ.query_string.as_bytes(), self.charset(), "query string");
            self.parsed_query = Some(parsed);
        }

        self.parsed_query.get_or_insert_with(Params::new)
    }

    /// Declared body length. An empty header counts as absent.
    pub fn content_length(&mut self) -> Result<Option<usize>, Error> {
        if let Some(length) = self.content_length {
            return Ok(length);
        }

        let length = match self.header("content-length").map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(
                slice_to_usize(value.as_bytes())
                    .ok_or_else(|| Error::InvalidContentLength(value.to_owned()))?,
            ),
        };

        self.content_length = Some(length);
        Ok(length)
    }

    /// Largest body [`body`](Request::body) agrees to load. Starts at the
    /// configured `maximum_buffer_size`.
    #[inline]
    pub fn maximum_buffer_size(&self) -> usize {
        self.maximum_buffer_size
    }

    #[inline]
    pub fn set_maximum_buffer_size(&mut self, size: usize) {
        self.maximum_buffer_size = size;
    }

    /// The raw body, read once.
    ///
    /// Fails with [`Error::PayloadTooLarge`] before touching the input when
    /// the declared length is over the limit.
    pub fn body(&mut self) -> Result<Option<&[u8]>, Error> {
        if self.body.is_none() {
            let body = self.read_body()?;
            self.body = Some(body);
        }

        Ok(self.body.as_ref().and_then(|body| body.as_deref()))
    }

    fn read_body(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let length = match self.content_length()? {
            None | Some(0) => return Ok(None),
            Some(length) => length,
        };

        if length > self.maximum_buffer_size {
            return Err(Error::PayloadTooLarge {
                length,
                limit: self.maximum_buffer_size,
            });
        }

        let mut buffer = Vec::with_capacity(length);
        (&mut self.environ.input)
            .take(length as u64)
            .read_to_end(&mut buffer)?;

        if buffer.len() < length {
            debug!(expected = length, read = buffer.len(), "request body is shorter than declared");
        }

        Ok(Some(buffer))
    }

    /// Form-decoded body. Bodies that aren't form data give an empty map.
    pub fn parsed_body(&mut self) -> Result<&Params, Error> {
        if self.parsed_body.is_none() {
            let charset = self.charset().to_owned();
            let parsed = match self.body()? {
                Some(body) => decode_params(body, &charset, "body"),
                None => Params::new(),
            };
            self.parsed_body = Some(parsed);
        }

        Ok(self.parsed_body.get_or_insert_with(Params::new))
    }

    /// The body as `multipart/form-data`. Other content types, and multipart
    /// bodies that don't parse, give no fields and no files.
    pub fn multipart(&mut self) -> Result<&Multipart, Error> {
        if self.multipart.is_none() {
            let boundary = self.content_type().and_then(multipart::boundary).map(str::to_owned);
            let charset = Charset::from_label(self.charset()).unwrap_or_default();

            let parsed = match (boundary, self.body()?) {
                (Some(boundary), Some(body)) => multipart::parse(body, &boundary, charset, PARAMETER_LIMIT)
                    .unwrap_or_else(|err| {
                        warn!(%err, "cannot decode multipart body");
                        Multipart::default()
                    }),
                _ => Multipart::default(),
            };
            self.multipart = Some(parsed);
        }

        Ok(self.multipart.get_or_insert_with(Multipart::default))
    }

    /// Plain fields of a multipart body.
    #[inline]
    pub fn parsed_multi(&mut self) -> Result<&Params, Error> {
        Ok(&self.multipart()?.fields)
    }

    /// Uploaded files of a multipart body.
    #[inline]
    pub fn files(&mut self) -> Result<&Files, Error> {
        Ok(&self.multipart()?.files)
    }

    /// The body parsed as JSON, or `None` if it doesn't parse.
    ///
    /// Doesn't look at the content type, check [`is_json`](Request::is_json)
    /// before trusting the result.
    pub fn json(&mut self) -> Result<Option<&Value>, Error> {
        if self.json.is_none() {
            let parsed = match self.body()? {
                Some(body) => serde_json::from_slice::<Value>(body)
                    .map_err(|err| warn!(%err, "request body is not valid JSON"))
                    .ok(),
                None => None,
            };
            self.json = Some(parsed);
        }

        Ok(self.json.as_ref().and_then(Option::as_ref))
    }

    pub fn cookies(&mut self) -> &BTreeMap<String, String> {
        let Self {
            cookies, environ, ..
        } = self;

        cookies.get_or_insert_with(|| environ.get("cookie").map(cookie::parse).unwrap_or_default())
    }

    #[inline]
    pub fn cookie(&mut self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(String::as_str)
    }

    /// The unquoted `redirect-to` cookie, e.g. `http://example.com/my-account`.
    pub fn redirect_cookie(&mut self) -> Option<String> {
        self.cookie(REDIRECT_TO).map(cookie::unquote_plus)
    }
}

// Route parameters
impl Request<'_> {
    /// Named captures of the route pattern that accepted this request.
    #[inline]
    pub fn route_params(&self) -> &BTreeMap<String, String> {
        &self.route_params
    }

    #[inline]
    pub fn route_param(&self, name: &str) -> Option<&str> {
        self.route_params.get(name).map(String::as_str)
    }

    pub fn set_route_params(&mut self, params: BTreeMap<String, String>) {
        self.route_params.extend(params);
    }
}

// Session and user
impl Request<'_> {
    /// Resolves the session cookie pair, once. See [`session::resolve`].
    pub fn session_state(&mut self) -> Result<&SessionState, Error> {
        if self.session.is_none() {
            self.cookies();

            let Self {
                cookies,
                config,
                tx,
                ..
            } = self;
            let jar = cookies.get_or_insert_with(BTreeMap::new);
            let state = session::resolve(jar, config.app_secret(), &mut **tx, Utc::now())?;

            self.session = Some(state);
        }

        Ok(self.session.get_or_insert(SessionState::NoSession))
    }

    #[inline]
    pub fn session(&mut self) -> Result<Option<&Session>, Error> {
        Ok(self.session_state()?.session())
    }

    /// The signed-in user. Looked up once, and only from a valid session
    /// that names a user.
    pub fn user(&mut self) -> Result<Option<&User>, Error> {
        if self.user.is_none() {
            let user = match self.session()?.and_then(|session| session.user_id) {
                Some(user_id) => self.tx.find_user(user_id)?,
                None => None,
            };
            self.user = Some(user);
        }

        Ok(self.user.as_ref().and_then(Option::as_ref))
    }

    /// The signed-in user's display name, if they have set one.
    pub fn signed_in_user_display_name(&mut self) -> Result<Option<&str>, Error> {
        Ok(self.user()?.and_then(|user| user.display_name.as_deref()))
    }

    /// Extends the session, if there is one and it hasn't expired yet.
    pub fn maybe_update_session_expires_time(&mut self) -> Result<Option<DateTime<Utc>>, Error> {
        self.session_state()?;

        let Self { session, tx, .. } = self;
        match session.as_ref().and_then(SessionState::session) {
            Some(session) => session.maybe_update_expires_time(&mut **tx),
            None => Ok(None),
        }
    }

    /// Namespaced session payload.
    pub fn session_data(&mut self, namespace: &str) -> Result<Option<Value>, Error> {
        self.session_state()?;

        let Self { session, tx, .. } = self;
        match session.as_ref().and_then(SessionState::session) {
            Some(session) => session.retrieve_session_data(&mut **tx, namespace),
            None => Ok(None),
        }
    }

    /// Namespaced session payload, deleted after reading.
    pub fn pop_session_data(&mut self, namespace: &str) -> Result<Option<Value>, Error> {
        self.session_state()?;

        let Self { session, tx, .. } = self;
        match session.as_ref().and_then(SessionState::session) {
            Some(session) => session.pop_session_data(&mut **tx, namespace),
            None => Ok(None),
        }
    }
}

// One-shot news message
impl Request<'_> {
    /// The unquoted `news-message` cookie.
    ///
    /// When a `news-message-hexdigest` cookie comes along, it must match the
    /// message, otherwise the message is ignored.
    pub fn news_message_cookie(&mut self) -> Option<&str> {
        if self.news_message.is_none() {
            let secret = self.config.app_secret();
            let jar = self.cookies();

            let message = jar.get(NEWS_MESSAGE).and_then(|quoted| {
                match jar.get(NEWS_MESSAGE_HEXDIGEST) {
                    Some(digest) if !session::verify(secret, quoted, digest) => {
                        warn!("ignoring a news message with an invalid HMAC");
                        None
                    }
                    _ => Some(cookie::unquote_plus(quoted)),
                }
            });
            self.news_message = Some(message);
        }

        self.news_message.as_ref().and_then(|message| message.as_deref())
    }

    /// Reads the news message and records that it was shown.
    ///
    /// Calling it again returns the same message; the dispatcher expires the
    /// cookie once, in this exchange's response.
    pub fn pop_news_message_cookie(&mut self) -> Option<&str> {
        if self.news_message_cookie().is_some() {
            self.news_message_popped = true;
        }

        self.news_message.as_ref().and_then(|message| message.as_deref())
    }

    #[inline]
    pub fn news_message_cookie_popped(&self) -> bool {
        self.news_message_popped
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("environ", &self.environ)
            .field("route_params", &self.route_params)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Percent-decodes a request path, `None` if the result isn't UTF-8.
pub(crate) fn decode_path(raw: &str) -> Option<String> {
    percent_decode_str(raw).decode_utf8().ok().map(Cow::into_owned)
}

fn decode_params(src: &[u8], label: &str, what: &str) -> Params {
    let Some(charset) = Charset::from_label(label) else {
        warn!(charset = label, "cannot decode {what}: unsupported charset");
        return Params::new();
    };

    Query::parse(src, charset, PARAMETER_LIMIT).unwrap_or_else(|err| {
        warn!(%err, "cannot decode {what}, probably dealing with a file upload");
        Params::new()
    })
}
