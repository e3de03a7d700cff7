//! Session records, signed session cookies and session resolution.

use crate::{
    errors::Error,
    http::cookie::{SESSION_HEXDIGEST, SESSION_TOKEN},
    store::Transaction,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// A persisted authentication record.
///
/// Valid only while `now < expires`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: Uuid,
    pub user_id: Option<Uuid>,
    pub expires: DateTime<Utc>,
    pub news_message: Option<String>,
    pub redirect_to_url: Option<String>,
    pub inserted: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Session {
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires
    }

    /// Pushes the expiry forward, but only if the session hasn't expired yet.
    ///
    /// Returns the new expiry, or `None` if the session was already dead.
    pub fn maybe_update_expires_time(
        &self,
        tx: &mut dyn Transaction,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let expires = tx.extend_session(self.token, Utc::now())?;
        debug!(token = %self.token, ?expires, "touched session");
        Ok(expires)
    }

    /// Reads the payload stored under `namespace`.
    #[inline]
    pub fn retrieve_session_data(
        &self,
        tx: &mut dyn Transaction,
        namespace: &str,
    ) -> Result<Option<Value>, Error> {
        tx.session_data(self.token, namespace)
    }

    /// Reads the payload stored under `namespace`, then deletes it.
    pub fn pop_session_data(
        &self,
        tx: &mut dyn Transaction,
        namespace: &str,
    ) -> Result<Option<Value>, Error> {
        let data = tx.session_data(self.token, namespace)?;
        if data.is_some() {
            tx.delete_session_data(self.token, namespace)?;
        }

        Ok(data)
    }
}

/// The signed-in person behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub group_title: Option<String>,
    pub is_superuser: bool,
}

/// Everything needed to open a new session after a credential check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSession {
    pub user_id: Option<Uuid>,
    pub news_message: Option<String>,
    pub redirect_to_url: Option<String>,
}

impl NewSession {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn news_message<M: Into<String>>(mut self, message: M) -> Self {
        self.news_message = Some(message.into());
        self
    }

    pub fn redirect_to_url<U: Into<String>>(mut self, url: U) -> Self {
        self.redirect_to_url = Some(url.into());
        self
    }
}

/// Outcome of resolving the session cookie pair.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No cookie pair, an unknown or expired token, or a malformed one.
    NoSession,
    Valid(Session),
    /// The digest doesn't match the token. The store was never queried.
    Tampered,
}

impl SessionState {
    #[inline]
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Valid(session) => Some(session),
            _ => None,
        }
    }
}

/// Hex-encoded `HMAC-SHA256(secret, message)`.
///
/// ```
/// let digest = paddock::session::sign("secret", "hello");
/// assert_eq!(digest.len(), 64);
/// assert!(paddock::session::verify("secret", "hello", &digest));
/// ```
pub fn sign(secret: &str, message: &str) -> String {
    hex::encode(keyed(secret).chain_update(message.as_bytes()).finalize().into_bytes())
}

/// Constant-time check of a hex digest produced by [`sign`].
pub fn verify(secret: &str, message: &str, digest: &str) -> bool {
    let Ok(digest) = hex::decode(digest.trim()) else {
        return false;
    };

    keyed(secret)
        .chain_update(message.as_bytes())
        .verify_slice(&digest)
        .is_ok()
}

#[inline]
fn keyed(secret: &str) -> HmacSha256 {
    // HMAC takes keys of any length
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any size"),
    }
}

/// Runs the session resolution protocol over a parsed cookie jar.
///
/// 1. A missing `session_uuid` or `session_hexdigest` cookie is `NoSession`.
/// 2. A digest that isn't `HMAC(secret, token)` is `Tampered`, with no
///    store access at all.
/// 3. A token that isn't a UUID is `NoSession`.
/// 4. Otherwise the store decides: a live row is `Valid`, nothing is
///    `NoSession`.
pub fn resolve(
    cookies: &BTreeMap<String, String>,
    secret: &str,
    tx: &mut dyn Transaction,
    now: DateTime<Utc>,
) -> Result<SessionState, Error> {
    let (Some(token), Some(digest)) = (cookies.get(SESSION_TOKEN), cookies.get(SESSION_HEXDIGEST))
    else {
        return Ok(SessionState::NoSession);
    };

    if !verify(secret, token, digest) {
        info!("caught a session with an invalid HMAC");
        return Ok(SessionState::Tampered);
    }

    let Ok(token) = Uuid::parse_str(token) else {
        debug!(token, "signed session token is not a UUID");
        return Ok(SessionState::NoSession);
    };

    Ok(match tx.find_live_session(token, now)? {
        Some(session) => SessionState::Valid(session),
        None => SessionState::NoSession,
    })
}
