//! Handlers, route helpers and the precondition decorators.
//!
//! A [`Handler`] looks at a request in [`route`](Handler::route) and either
//! declines it or returns the function that will handle it. Handlers are
//! asked in registration order and the first one to accept wins.
//!
//! ```
//! use paddock::{handler::{self, Routes}, Error, Handled, HandleFn, Handler, JsonStatus, Request, Response};
//! use serde_json::json;
//!
//! struct Folders {
//!     routes: Routes,
//! }
//!
//! impl Folders {
//!     fn new() -> Result<Self, Error> {
//!         Ok(Self { routes: Routes::new().pattern(r"GET /api/folders/(?P<folder_id>\d+)$")? })
//!     }
//!
//!     fn show(&self, req: &mut Request<'_>) -> Handled {
//!         let folder_id = req.route_param("folder_id").unwrap_or_default();
//!         Response::json(&json!({ "folder_id": folder_id }), JsonStatus::Ok)
//!     }
//! }
//!
//! impl Handler for Folders {
//!     fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
//!         Ok(self
//!             .routes
//!             .check_route_patterns(req)?
//!             .then(|| handler::handle_fn(handler::require_login(move |req: &mut Request<'_>| self.show(req)))))
//!     }
//! }
//! ```

use crate::{
    errors::Error,
    http::{request::Request, response::{JsonStatus, Response}, types::StatusCode},
    json::Envelope,
    store::Transaction,
    templates::NOT_FOUND_TEMPLATE,
};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// What every handling function returns.
pub type Handled = Result<Response, Error>;

/// A handling function chosen by [`Handler::route`]. It may borrow the
/// handler that produced it.
pub type HandleFn<'h> = Box<dyn Fn(&mut Request<'_>) -> Handled + 'h>;

/// A unit of routing and handling logic.
pub trait Handler: Send + Sync {
    /// Returns the function that should handle `req`, or `None` to let the
    /// next handler have a look.
    ///
    /// Should fail only for configuration mistakes, such as checking an
    /// empty [`Routes`].
    fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error>;

    /// Runs once before any traffic, inside the startup transaction.
    fn on_startup(&self, _tx: &mut dyn Transaction) -> Result<(), Error> {
        Ok(())
    }

    /// Used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Boxes a handling function.
///
/// Closures passed here get the higher-ranked `&mut Request<'_>` signature
/// without further annotation.
#[inline]
pub fn handle_fn<'h, F>(handle: F) -> HandleFn<'h>
where
    F: Fn(&mut Request<'_>) -> Handled + 'h,
{
    Box::new(handle)
}

/// The handler the dispatcher always registers last. It accepts anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl Handler for NotFound {
    fn route<'h>(&'h self, _req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
        Ok(Some(handle_fn(not_found)))
    }
}

/// Literal route strings and route patterns, checked against
/// [`Request::line_one`].
#[derive(Debug, Clone, Default)]
pub struct Routes {
    strings: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a literal like `"GET /login"`.
    pub fn string<S: Into<String>>(mut self, route: S) -> Self {
        self.strings.insert(route.into());
        self
    }

    /// Adds a pattern like `GET /products/(?P<id>\d+)`. Patterns must match
    /// from the start of the line and are tried in the order they were added.
    pub fn pattern(mut self, pattern: &str) -> Result<Self, Error> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Membership test of the request line against the literal routes.
    pub fn check_route_strings(&self, req: &Request<'_>) -> Result<bool, Error> {
        if self.strings.is_empty() {
            return Err(Error::RouteConfig("you need to define some route strings".to_owned()));
        }

        Ok(self.strings.contains(req.line_one().as_str()))
    }

    /// Tries each pattern in order. On the first match its named captures
    /// are copied into [`Request::route_params`].
    pub fn check_route_patterns(&self, req: &mut Request<'_>) -> Result<bool, Error> {
        if self.patterns.is_empty() {
            return Err(Error::RouteConfig("you need some route patterns".to_owned()));
        }

        let line_one = req.line_one();
        let found = self
            .patterns
            .iter()
            .find_map(|pattern| line_one.matches(pattern));

        match found {
            Some(found) => {
                req.set_route_params(found.params());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Literal routes first, then patterns. Fails only when both are empty.
    pub fn check(&self, req: &mut Request<'_>) -> Result<bool, Error> {
        if self.strings.is_empty() && self.patterns.is_empty() {
            return Err(Error::RouteConfig("no route strings or patterns".to_owned()));
        }

        Ok((!self.strings.is_empty() && self.check_route_strings(req)?)
            || (!self.patterns.is_empty() && self.check_route_patterns(req)?))
    }
}

fn refuse(envelope: Envelope, status: StatusCode) -> Handled {
    let mut resp = Response::json(&envelope, JsonStatus::Ok)?;
    resp.set_status(status);
    Ok(resp)
}

/// A 404 in the request's dialect: plain text for AJAX, a JSON envelope for
/// JSON requests, the 404 template for everything else.
pub fn not_found(req: &mut Request<'_>) -> Handled {
    if req.is_ajax() {
        let mut resp = Response::plain("404 NOT FOUND");
        resp.set_status(StatusCode::NotFound);
        Ok(resp)
    } else if req.is_json() {
        let envelope = Envelope::failure(format!("404 NOT FOUND '{}'", req.line_one()));
        Response::json(&envelope, JsonStatus::NotFound)
    } else {
        let context = json!({ "path": req.path() });
        let mut resp = Response::tmpl(req, NOT_FOUND_TEMPLATE, &context)?;
        resp.set_status(StatusCode::NotFound);
        Ok(resp)
    }
}

/// Asks an anonymous visitor to sign in, in the request's dialect.
///
/// Browsers are sent to `/login` with a news message and a `redirect-to`
/// cookie pointing back at the page they asked for.
pub fn prompt_for_login(req: &mut Request<'_>) -> Handled {
    const MESSAGE: &str = "You have to log in first!";

    if req.is_ajax() {
        let mut resp = Response::plain(MESSAGE);
        resp.set_status(StatusCode::Unauthorized);
        Ok(resp)
    } else if req.is_json() {
        refuse(Envelope::failure(MESSAGE), StatusCode::Unauthorized)
    } else {
        let config = req.config();
        let mut resp = Response::relative_redirect(config, "/login")?;
        resp.set_news_message_cookie(MESSAGE, Some(config.app_secret()))
            .set_redirect_cookie(&req.address_bar());
        Ok(resp)
    }
}

/// A handling function that sends the visitor to `/login` with `message`,
/// coming back to `redirect_location` afterwards.
pub fn ask_to_authenticate_first<L, M>(redirect_location: L, message: M) -> impl Fn(&mut Request<'_>) -> Handled
where
    L: Into<String>,
    M: Into<String>,
{
    let redirect_location = redirect_location.into();
    let message = message.into();

    move |req: &mut Request<'_>| {
        let config = req.config();
        let mut resp = Response::relative_redirect(config, "/login")?;
        resp.set_news_message_cookie(&message, Some(config.app_secret()))
            .set_redirect_cookie(&redirect_location);
        Ok(resp)
    }
}

// Decorators

/// Refuses anonymous requests with `401` and `needs_to_log_in: true`.
pub fn require_login<F>(handle: F) -> impl Fn(&mut Request<'_>) -> Handled
where
    F: Fn(&mut Request<'_>) -> Handled,
{
    move |req: &mut Request<'_>| {
        if req.user()?.is_none() {
            return refuse(
                Envelope::failure("Sorry, you need to log in first!").needs_to_log_in(),
                StatusCode::Unauthorized,
            );
        }

        handle(req)
    }
}

/// Refuses requests that aren't JSON, have an empty or unparsable body, or
/// lack any of `required_keys`. The refusal names every missing key.
pub fn require_json<I, K, F>(required_keys: I, handle: F) -> impl Fn(&mut Request<'_>) -> Handled
where
    I: IntoIterator<Item = K>,
    K: Into<String>,
    F: Fn(&mut Request<'_>) -> Handled,
{
    let required: Vec<String> = required_keys.into_iter().map(Into::into).collect();

    move |req: &mut Request<'_>| {
        let missing = match req.is_json() {
            true => match req.json()? {
                Some(json) if is_truthy(json) => Some(find_missing_keys(json, &required)),
                _ => None,
            },
            false => None,
        };

        match missing {
            None => refuse(Envelope::failure("Sorry, invalid request!"), StatusCode::BadRequest),
            Some(missing) if !missing.is_empty() => {
                warn!(line_one = %req.line_one(), ?missing, "request is missing JSON keys");
                refuse(
                    Envelope::failure(format!("Sorry, you are missing keys: [{}]!", missing.join(", "))),
                    StatusCode::BadRequest,
                )
            }
            Some(_) => handle(req),
        }
    }
}

/// Refuses requests unless the signed-in user's group is one of
/// `required_groups`.
pub fn require_group<I, G, F>(required_groups: I, handle: F) -> impl Fn(&mut Request<'_>) -> Handled
where
    I: IntoIterator<Item = G>,
    G: Into<String>,
    F: Fn(&mut Request<'_>) -> Handled,
{
    let required: Vec<String> = required_groups.into_iter().map(Into::into).collect();

    move |req: &mut Request<'_>| {
        let allowed = req
            .user()?
            .and_then(|user| user.group_title.as_deref())
            .map_or(false, |group| required.iter().any(|r| r == group));

        if !allowed {
            debug!(line_one = %req.line_one(), "user is not in a required group");
            return refuse(
                Envelope::failure(format!("Sorry, you are not in the group: [{}]!", required.join(","))),
                StatusCode::Forbidden,
            );
        }

        handle(req)
    }
}

/// Refuses requests unless the signed-in user is a superuser.
pub fn only_allow_superusers<F>(handle: F) -> impl Fn(&mut Request<'_>) -> Handled
where
    F: Fn(&mut Request<'_>) -> Handled,
{
    move |req: &mut Request<'_>| {
        if !req.user()?.map_or(false, |user| user.is_superuser) {
            return refuse(Envelope::failure("Sorry, superusers only!"), StatusCode::Forbidden);
        }

        handle(req)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map_or(true, |n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn find_missing_keys<'k>(json: &Value, required: &'k [String]) -> Vec<&'k str> {
    required
        .iter()
        .filter(|key| match json {
            Value::Object(map) => !map.contains_key(key.as_str()),
            Value::Array(items) => !items.iter().any(|item| item.as_str() == Some(key.as_str())),
            _ => true,
        })
        .map(String::as_str)
        .collect()
}
