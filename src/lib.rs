//! paddock - request dispatch, sessions and responses for small database-backed web apps
//!
//! A synchronous core that turns one HTTP exchange into one [`Request`],
//! picks a [`Handler`] for it, runs the handler inside one store
//! [`Transaction`](store::Transaction) and produces one [`Response`].
//!
//! # Request lifecycle
//!
//! - **One transaction per request** - committed when the handler succeeds,
//!   rolled back when it fails, never left open
//! - **Lazy, memoized request data** - query, body, JSON, cookies, session
//!   and user are computed on first access and at most once
//! - **Signed cookies** - session tokens and news messages carry an
//!   HMAC-SHA256 digest; a tampered session never reaches the store
//! - **First match wins** - handlers are asked in registration order, with
//!   a catch-all 404 handler last
//! - **Declarative preconditions** - [`require_login`](handler::require_login),
//!   [`require_json`](handler::require_json),
//!   [`require_group`](handler::require_group) and
//!   [`only_allow_superusers`](handler::only_allow_superusers) wrap any
//!   handling function
//!
//! # Examples
//!
//! A handler with a literal route and a pattern route:
//! ```
//! use paddock::{
//!     handler::{self, Routes},
//!     store::MemoryStore,
//!     Config, Dispatcher, Environ, Error, HandleFn, Handled, Handler, JsonStatus, Request, Response,
//! };
//! use serde_json::json;
//!
//! struct Projects {
//!     routes: Routes,
//! }
//!
//! impl Projects {
//!     fn list(&self, _: &mut Request<'_>) -> Handled {
//!         Response::json(&json!({ "projects": ["alpha", "beta"] }), JsonStatus::Ok)
//!     }
//!
//!     fn show(&self, req: &mut Request<'_>) -> Handled {
//!         let name = req.route_param("name").unwrap_or_default().to_owned();
//!         Ok(Response::plain(format!("project {name}")))
//!     }
//! }
//!
//! impl Handler for Projects {
//!     fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
//!         if self.routes.check_route_strings(req)? {
//!             return Ok(Some(handler::handle_fn(move |req: &mut Request<'_>| self.list(req))));
//!         }
//!
//!         let pattern = Routes::new().pattern(r"GET /projects/(?P<name>\w+)$")?;
//!         Ok(pattern
//!             .check_route_patterns(req)?
//!             .then(|| handler::handle_fn(move |req: &mut Request<'_>| self.show(req))))
//!     }
//! }
//!
//! let dispatcher = Dispatcher::builder()
//!     .config(Config::new("http", "example.com", "secret"))
//!     .store(MemoryStore::new())
//!     .handler(Projects { routes: Routes::new().string("GET /projects") })
//!     .build()
//!     .unwrap();
//!
//! let resp = dispatcher.call(Environ::from_url("http://example.com/projects/alpha").unwrap()).unwrap();
//! assert_eq!(resp.body().as_bytes(), Some(&b"project alpha"[..]));
//! ```
//!
//! Serving it over HTTP:
//! ```no_run
//! # fn dispatcher() -> paddock::Dispatcher { unimplemented!() }
//! use paddock::{Config, Server};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_file("app.toml").unwrap();
//!     config.init_logging();
//!
//!     Server::builder()
//!         .listener(TcpListener::bind(&config.server.address).await.unwrap())
//!         .dispatcher(dispatcher())
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

pub(crate) mod http {
    pub mod cookie;
    pub mod multipart;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub mod route;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod parser;
    pub(crate) mod server_impl;
}
pub mod config;
pub(crate) mod dispatcher;
pub(crate) mod errors;
pub mod handler;
pub mod json;
pub mod limits;
pub mod scrubber;
pub mod session;
pub mod store;
pub mod templates;

pub use crate::{
    config::Config,
    dispatcher::{Dispatcher, DispatcherBuilder},
    errors::Error,
    handler::{HandleFn, Handled, Handler},
    http::{
        cookie, multipart, query, route,
        request::{Environ, Request},
        response::{Body, JsonStatus, Response},
        route::LineOne,
        types::{Method, StatusCode, Version},
    },
    server::server_impl::{Server, ServerBuilder},
    session::{Session, SessionState, User},
};

#[cfg(test)]
pub(crate) mod tools {
    use crate::{
        config::Config,
        errors::Error,
        http::{
            cookie::{SESSION_HEXDIGEST, SESSION_TOKEN},
            request::{Environ, Request},
        },
        session::{self, NewSession, Session, User},
        store::Transaction,
        templates::StaticTemplates,
    };
    use chrono::{DateTime, Duration, Utc};
    use serde_json::Value;
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };
    use uuid::Uuid;

    pub(crate) fn test_config() -> Config {
        Config::new("http", "example.com", "test secret")
    }

    pub(crate) fn sample_user() -> User {
        User {
            user_id: Uuid::from_u128(0x7a1b_0000_0000_4000_8000_0000_0000_0001),
            email: "matt@example.com".to_owned(),
            display_name: Some("Matt".to_owned()),
            group_title: Some("user".to_owned()),
            is_superuser: false,
        }
    }

    /// A session that stays live for a day.
    pub(crate) fn sample_session(user_id: Option<Uuid>) -> Session {
        let now = Utc::now();

        Session {
            token: Uuid::from_u128(0x5e55_0000_0000_4000_8000_0000_0000_0001),
            user_id,
            expires: now + Duration::days(1),
            news_message: None,
            redirect_to_url: None,
            inserted: now - Duration::hours(1),
            updated: now - Duration::hours(1),
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct Calls {
        pub(crate) find_live_session: usize,
        pub(crate) find_user: usize,
        pub(crate) extend_session: usize,
    }

    /// A transaction over plain maps that counts its store calls.
    #[derive(Debug, Default)]
    pub(crate) struct StubTransaction {
        sessions: HashMap<Uuid, Session>,
        users: HashMap<Uuid, User>,
        data: HashMap<(Uuid, String), Value>,
        calls: Arc<Mutex<Calls>>,
    }

    impl StubTransaction {
        pub(crate) fn with_session(session: Session) -> Self {
            let mut tx = Self::default();
            tx.sessions.insert(session.token, session);
            tx
        }

        pub(crate) fn with_user(mut self, user: User) -> Self {
            self.users.insert(user.user_id, user);
            self
        }

        pub(crate) fn calls(&self) -> Arc<Mutex<Calls>> {
            Arc::clone(&self.calls)
        }

        fn count(&self, bump: impl FnOnce(&mut Calls)) {
            if let Ok(mut calls) = self.calls.lock() {
                bump(&mut calls);
            }
        }
    }

    impl Transaction for StubTransaction {
        fn find_live_session(&mut self, token: Uuid, now: DateTime<Utc>) -> Result<Option<Session>, Error> {
            self.count(|calls| calls.find_live_session += 1);
            Ok(self
                .sessions
                .get(&token)
                .filter(|session| session.is_live(now))
                .cloned())
        }

        fn find_user(&mut self, user_id: Uuid) -> Result<Option<User>, Error> {
            self.count(|calls| calls.find_user += 1);
            Ok(self.users.get(&user_id).cloned())
        }

        fn create_session(&mut self, new: &NewSession) -> Result<Session, Error> {
            let mut session = sample_session(new.user_id);
            session.token = Uuid::new_v4();
            session.news_message = new.news_message.clone();
            session.redirect_to_url = new.redirect_to_url.clone();

            self.sessions.insert(session.token, session.clone());
            Ok(session)
        }

        fn extend_session(&mut self, token: Uuid, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
            self.count(|calls| calls.extend_session += 1);
            Ok(self
                .sessions
                .get_mut(&token)
                .filter(|session| session.is_live(now))
                .map(|session| {
                    session.expires = now + Duration::days(14);
                    session.expires
                }))
        }

        fn session_data(&mut self, token: Uuid, namespace: &str) -> Result<Option<Value>, Error> {
            Ok(self.data.get(&(token, namespace.to_owned())).cloned())
        }

        fn set_session_data(&mut self, token: Uuid, namespace: &str, data: Value) -> Result<(), Error> {
            self.data.insert((token, namespace.to_owned()), data);
            Ok(())
        }

        fn delete_session_data(&mut self, token: Uuid, namespace: &str) -> Result<(), Error> {
            self.data.remove(&(token, namespace.to_owned()));
            Ok(())
        }

        fn commit(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
    }

    /// Everything a [`Request`] borrows, owned in one place.
    pub(crate) struct Fixture {
        pub(crate) config: Config,
        pub(crate) templates: StaticTemplates,
        pub(crate) tx: StubTransaction,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self {
                config: test_config(),
                templates: StaticTemplates::new(),
                tx: StubTransaction::default(),
            }
        }

        pub(crate) fn with_session(session: Session, user: Option<User>) -> Self {
            let tx = StubTransaction::with_session(session);

            Self {
                tx: match user {
                    Some(user) => tx.with_user(user),
                    None => tx,
                },
                ..Self::new()
            }
        }

        pub(crate) fn request(&mut self, environ: Environ) -> Request<'_> {
            Request::new(environ, &self.config, &self.templates, &mut self.tx)
        }

        /// A `Cookie` header value carrying `session`'s signed token.
        pub(crate) fn session_cookie(&self, session: &Session) -> String {
            let token = session.token.to_string();
            let digest = session::sign(self.config.app_secret(), &token);

            format!("{SESSION_TOKEN}={token}; {SESSION_HEXDIGEST}={digest}")
        }
    }
}
