//! Sign-in flow with the in-memory store.
//!
//! ```text
//! cargo run --example notes
//! curl -i -c jar -b jar -d 'email=matt@example.com&password=hunter2' http://127.0.0.1:8080/login
//! curl -i -b jar http://127.0.0.1:8080/notes
//! curl -i -b jar -H 'Content-Type: application/json' -d '{"title": "milk"}' http://127.0.0.1:8080/api/notes
//! ```

use paddock::{
    handler::{self, Routes},
    scrubber::{self, Scrubber},
    session::NewSession,
    store::{MemoryStore, Transaction},
    Config, Dispatcher, Error, HandleFn, Handled, Handler, JsonStatus, Request, Response, Server, User,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::net::TcpListener;
use uuid::Uuid;

const NOTES: &str = "notes";

struct Login {
    routes: Routes,
    passwords: HashMap<String, (Uuid, String)>,
}

impl Login {
    fn form(&self, req: &mut Request<'_>) -> Handled {
        let message = req.pop_news_message_cookie().unwrap_or_default().to_owned();

        Response::tmpl(req, "login.html", &json!({ "message": message }))
    }

    fn submit(&self, req: &mut Request<'_>) -> Handled {
        let mut scrubber = Scrubber::new();
        scrubber
            .extract_with("email", req.parsed_body()?, true, scrubber::validate_email_address)
            .extract("password", req.parsed_body()?, true);

        let user_id = match (scrubber.values.get("email"), scrubber.values.get("password")) {
            (Some(Value::String(email)), Some(Value::String(password))) if scrubber.is_clean() => self
                .passwords
                .get(email)
                .filter(|(_, expected)| expected == password)
                .map(|(user_id, _)| *user_id),
            _ => None,
        };

        let Some(user_id) = user_id else {
            let config = req.config();
            let mut resp = Response::relative_redirect(config, "/login")?;
            resp.set_news_message_cookie("Sorry, that didn't work", Some(config.app_secret()));
            return Ok(resp);
        };

        let session = req
            .transaction()
            .create_session(&NewSession::for_user(user_id).news_message("Welcome back!"))?;

        let config = req.config();
        let mut resp = match req.redirect_cookie().is_some() {
            true => Response::redirect_from_cookie(req)?,
            false => Response::relative_redirect(config, "/notes")?,
        };
        resp.set_session_cookie(&session.token.to_string(), config.app_secret(), session.expires, "/")
            .set_news_message_cookie("Welcome back!", Some(config.app_secret()));
        Ok(resp)
    }
}

impl Handler for Login {
    fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
        if !self.routes.check_route_strings(req)? {
            return Ok(None);
        }

        Ok(Some(match req.is_post() {
            true => handler::handle_fn(move |req: &mut Request<'_>| self.submit(req)),
            false => handler::handle_fn(move |req: &mut Request<'_>| self.form(req)),
        }))
    }

    fn on_startup(&self, _: &mut dyn Transaction) -> Result<(), Error> {
        tracing::info!(users = self.passwords.len(), "login handler ready");
        Ok(())
    }
}

struct Notes {
    routes: Routes,
}

impl Notes {
    fn list(&self, req: &mut Request<'_>) -> Handled {
        let notes = req.session_data(NOTES)?.unwrap_or_else(|| json!([]));
        let banner = req.pop_news_message_cookie().map(str::to_owned);

        Response::json(&json!({ "notes": notes, "banner": banner }), JsonStatus::Ok)
    }

    fn add(&self, req: &mut Request<'_>) -> Handled {
        let title = req
            .json()?
            .and_then(|body| body.get("title"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut notes = match req.session_data(NOTES)? {
            Some(Value::Array(notes)) => notes,
            _ => Vec::new(),
        };
        notes.push(title);

        let token = match req.session()? {
            Some(session) => session.token,
            None => return handler::prompt_for_login(req),
        };
        req.transaction().set_session_data(token, NOTES, Value::Array(notes))?;

        Response::json(&paddock::json::Envelope::success("Saved!"), JsonStatus::Ok)
    }
}

impl Handler for Notes {
    fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
        if !self.routes.check_route_strings(req)? {
            return Ok(None);
        }

        let handle = match req.is_post() {
            true => handler::handle_fn(handler::require_login(handler::require_json(
                ["title"],
                move |req: &mut Request<'_>| self.add(req),
            ))),
            false => handler::handle_fn(move |req: &mut Request<'_>| match req.user()?.is_some() {
                true => self.list(req),
                false => handler::prompt_for_login(req),
            }),
        };
        Ok(Some(handle))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new("http", "127.0.0.1:8080", "change me");
    config.init_logging();
    config.verify()?;

    let store = MemoryStore::new();
    let matt = User {
        user_id: Uuid::new_v4(),
        email: "matt@example.com".to_owned(),
        display_name: Some("Matt".to_owned()),
        group_title: None,
        is_superuser: false,
    };
    store.insert_user(matt.clone())?;

    let login = Login {
        routes: Routes::new().string("GET /login").string("POST /login"),
        passwords: HashMap::from([(matt.email.clone(), (matt.user_id, "hunter2".to_owned()))]),
    };
    let notes = Notes {
        routes: Routes::new().string("GET /notes").string("POST /api/notes"),
    };

    let templates = paddock::templates::StaticTemplates::new().with_template(
        "login.html",
        "<form method=post><p>{{ message }}</p>\
         <input name=email><input name=password type=password><button>Log in</button></form>",
    );

    let dispatcher = Dispatcher::builder()
        .config(config.clone())
        .store(store)
        .templates(templates)
        .handler(login)
        .handler(notes)
        .build()?;

    Server::builder()
        .listener(TcpListener::bind(&config.server.address).await?)
        .dispatcher(dispatcher)
        .build()
        .launch()
        .await;

    Ok(())
}
