//! The per-request lifecycle.
//!
//! One [`Dispatcher`] serves the whole application. For every exchange it
//! leases a transaction, builds the [`Request`], asks each registered
//! [`Handler`] in turn whether it wants the request, runs the chosen handling
//! function and finishes the transaction exactly once.

use crate::{
    config::Config,
    errors::Error,
    handler::{HandleFn, Handled, Handler, NotFound},
    http::{
        cookie::NEWS_MESSAGE_HEXDIGEST,
        request::{Environ, Request},
        response::{JsonStatus, Response},
        types::StatusCode,
    },
    json::Envelope,
    store::Store,
    templates::{StaticTemplates, Templates, ERROR_TEMPLATE},
};
use serde_json::json;
use std::fmt;
use tracing::{debug, error, info, warn};

const ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
const ALLOW_CREDENTIALS: &str = "Access-Control-Allow-Credentials";

/// Routes requests to handlers and owns everything they share.
///
/// # Examples
///
/// ```
/// use paddock::{handler::{self, Routes}, store::MemoryStore};
/// use paddock::{Config, Dispatcher, Environ, Error, HandleFn, Handler, Request, Response, StatusCode};
///
/// struct Hello {
///     routes: Routes,
/// }
///
/// impl Handler for Hello {
///     fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
///         Ok(self
///             .routes
///             .check_route_strings(req)?
///             .then(|| handler::handle_fn(|_: &mut Request<'_>| Ok(Response::plain("hello")))))
///     }
/// }
///
/// let dispatcher = Dispatcher::builder()
///     .config(Config::new("http", "example.com", "secret"))
///     .store(MemoryStore::new())
///     .handler(Hello { routes: Routes::new().string("GET /") })
///     .build()
///     .unwrap();
///
/// let resp = dispatcher.call(Environ::from_url("http://example.com/").unwrap()).unwrap();
/// assert_eq!(resp.body().as_bytes(), Some(&b"hello"[..]));
///
/// let resp = dispatcher.call(Environ::from_url("http://example.com/nope").unwrap()).unwrap();
/// assert_eq!(resp.status(), StatusCode::NotFound);
/// ```
pub struct Dispatcher {
    config: Config,
    store: Box<dyn Store>,
    templates: Box<dyn Templates>,
    handlers: Vec<Box<dyn Handler>>,
}

impl Dispatcher {
    #[inline]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder {
            config: None,
            store: None,
            templates: None,
            handlers: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles one exchange from start to finish.
    ///
    /// Handler failures never escape: the transaction is rolled back and the
    /// client gets a generic `500` (a JSON envelope for JSON requests, the
    /// error template otherwise). The only exceptions are
    /// [`launch_debugger_on_error`](Config::launch_debugger_on_error), which
    /// hands the failure back to the caller, and a store that can't even
    /// begin a transaction.
    pub fn call(&self, environ: Environ) -> Result<Response, Error> {
        let mut tx = self.store.begin()?;

        let (outcome, is_json) = {
            let mut req = Request::new(environ, &self.config, self.templates.as_ref(), &mut *tx);
            info!(method = %req.method(), path = %req.path_and_qs(), "got request");

            let is_json = req.is_json();
            let outcome = self.run(&mut req);

            if let Err(err) = &outcome {
                let parsed_body = match req.parsed_body() {
                    Ok(params) => format!("{params:?}"),
                    Err(_) => "unavailable".to_owned(),
                };
                error!(
                    %err,
                    address_bar = %req.address_bar(),
                    %parsed_body,
                    environ = ?req.environ(),
                    "request failed"
                );
            }

            (outcome, is_json)
        };

        let failure = match outcome {
            Ok(resp) => match tx.commit() {
                Ok(()) => {
                    match resp.header("location") {
                        Some(location) if resp.status().is_redirect() => {
                            info!(status = %resp.status(), %location, "replying");
                        }
                        _ => info!(status = %resp.status(), "replying"),
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    error!(%err, "commit failed");
                    err
                }
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!(err = %rollback_err, "rollback failed");
                }
                err
            }
        };

        if self.config.launch_debugger_on_error() {
            return Err(failure);
        }

        self.fallback(is_json)
    }

    /// Routing, handling and the response touch-ups every reply gets.
    pub fn run(&self, req: &mut Request<'_>) -> Handled {
        let handle = self.dispatch(req)?;
        let mut resp = handle(req)?;

        if req.news_message_cookie_popped() {
            resp.mark_news_message_as_expired();
            if req.cookie(NEWS_MESSAGE_HEXDIGEST).is_some() {
                resp.expire_news_message_hexdigest();
            }
        }

        if !resp.status().is_error() && req.user()?.is_some() {
            req.maybe_update_session_expires_time()?;
        }

        if self.config.access_control() {
            let origin = req.header("origin").unwrap_or("*").to_owned();

            if !resp.has_header(ALLOW_ORIGIN) {
                resp.add_header(ALLOW_ORIGIN, origin);
            }
            if !resp.has_header(ALLOW_CREDENTIALS) {
                resp.add_header(ALLOW_CREDENTIALS, "true");
            }
        }

        Ok(resp)
    }

    /// The handling function of the first handler that accepts `req`.
    pub fn dispatch<'h>(&'h self, req: &mut Request<'_>) -> Result<HandleFn<'h>, Error> {
        for handler in &self.handlers {
            if let Some(handle) = handler.route(req)? {
                debug!(handler = handler.name(), line_one = %req.line_one(), "dispatching");
                return Ok(handle);
            }
        }

        Err(Error::contract(format!("no handler accepted {}", req.line_one())))
    }

    fn fallback(&self, is_json: bool) -> Result<Response, Error> {
        const MESSAGE: &str = "Sorry, something went wrong!";

        if is_json {
            return Response::json(&Envelope::failure(MESSAGE), JsonStatus::InternalServerError);
        }

        let mut resp = Response::template(self.templates.as_ref(), ERROR_TEMPLATE, &json!({}))
            .unwrap_or_else(|err| {
                warn!(%err, "cannot render the error page");
                Response::plain(MESSAGE)
            });
        resp.set_status(StatusCode::InternalServerError);
        Ok(resp)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<&str> = self.handlers.iter().map(|handler| handler.name()).collect();

        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("handlers", &handlers)
            .finish_non_exhaustive()
    }
}

//

/// Builder for [`Dispatcher`].
///
/// `config`, `store` and at least one `handler` are required. Templates
/// default to [`StaticTemplates`].
pub struct DispatcherBuilder {
    config: Option<Config>,
    store: Option<Box<dyn Store>>,
    templates: Option<Box<dyn Templates>>,
    handlers: Vec<Box<dyn Handler>>,
}

impl DispatcherBuilder {
    #[inline(always)]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    #[inline(always)]
    pub fn store<S: Store + 'static>(mut self, store: S) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    #[inline(always)]
    pub fn templates<T: Templates + 'static>(mut self, templates: T) -> Self {
        self.templates = Some(Box::new(templates));
        self
    }

    /// Registers a handler. Handlers are asked in registration order; a
    /// catch-all 404 handler is always asked last.
    #[inline(always)]
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Runs every handler's [`on_startup`](Handler::on_startup) in one
    /// transaction, then returns the ready dispatcher.
    pub fn build(self) -> Result<Dispatcher, Error> {
        let DispatcherBuilder {
            config,
            store,
            templates,
            mut handlers,
        } = self;

        let config = config.ok_or_else(|| Error::contract("a dispatcher needs a config"))?;
        let store = store.ok_or_else(|| Error::contract("a dispatcher needs a store"))?;
        if handlers.is_empty() {
            return Err(Error::contract("no handlers registered"));
        }
        handlers.push(Box::new(NotFound));

        let mut tx = store.begin()?;
        for handler in &handlers {
            if let Err(err) = handler.on_startup(&mut *tx) {
                error!(handler = handler.name(), %err, "startup failed");
                tx.rollback()?;
                return Err(err);
            }
        }
        tx.commit()?;

        info!(handlers = handlers.len(), "framework is ready");

        Ok(Dispatcher {
            config,
            store,
            templates: templates.unwrap_or_else(|| Box::new(StaticTemplates::new())),
            handlers,
        })
    }
}
