//! Persistence collaborator.
//!
//! The framework never talks to a database directly. It leases one
//! [`Transaction`] per request from a [`Store`], runs every session lookup
//! and every handler write through it, and finishes it exactly once with
//! [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback).

use crate::{
    errors::Error,
    session::{NewSession, Session, User},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, trace};
use uuid::Uuid;

/// A source of per-request transactions.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, Error>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    #[inline]
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, Error> {
        (**self).begin()
    }
}

/// One transactional lease. Writes become visible to other transactions
/// only after [`commit`](Transaction::commit).
pub trait Transaction {
    /// A session with this token whose expiry is later than `now`.
    fn find_live_session(&mut self, token: Uuid, now: DateTime<Utc>) -> Result<Option<Session>, Error>;

    fn find_user(&mut self, user_id: Uuid) -> Result<Option<User>, Error>;

    fn create_session(&mut self, new: &NewSession) -> Result<Session, Error>;

    /// Resets the expiry of a session that is still live at `now`.
    ///
    /// Returns the new expiry, or `None` when there is no live session.
    fn extend_session(&mut self, token: Uuid, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error>;

    fn session_data(&mut self, token: Uuid, namespace: &str) -> Result<Option<Value>, Error>;

    fn set_session_data(&mut self, token: Uuid, namespace: &str, data: Value) -> Result<(), Error>;

    fn delete_session_data(&mut self, token: Uuid, namespace: &str) -> Result<(), Error>;

    fn commit(self: Box<Self>) -> Result<(), Error>;

    fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// # In-memory store
///
/// Nothing is persisted: all sessions and users are lost on restart.
///
/// A transaction holds the store lock from [`begin`](Store::begin) until it
/// is committed or rolled back, so transactions are fully serialized. Writes
/// are staged on a copy of the tables and published on commit.
///
/// Expired sessions are only removed by [`MemoryStore::cleanup`]. Run it on
/// an interval if the process lives long enough for that to matter.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    session_lifetime: Duration,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    users: HashMap<Uuid, User>,
    session_data: HashMap<(Uuid, String), Value>,
}

impl MemoryStore {
    /// Sessions live for two weeks unless told otherwise.
    pub fn new() -> Self {
        Self::with_session_lifetime(Duration::days(14))
    }

    pub fn with_session_lifetime(session_lifetime: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            session_lifetime,
        }
    }

    #[inline]
    pub fn session_lifetime(&self) -> Duration {
        self.session_lifetime
    }

    /// Adds or replaces a user outside of any transaction.
    pub fn insert_user(&self, user: User) -> Result<(), Error> {
        self.lock()?.users.insert(user.user_id, user);
        Ok(())
    }

    /// Number of stored sessions, live or not.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.lock()?.sessions.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Drops expired sessions and their namespaced data.
    pub fn cleanup(&self) -> Result<usize, Error> {
        trace!("Cleaning up memory store...");
        let now = Utc::now();
        let mut tables = self.lock()?;

        let initial_len = tables.sessions.len();
        tables.sessions.retain(|_, session| session.is_live(now));

        let Tables {
            sessions,
            session_data,
            ..
        } = &mut *tables;
        session_data.retain(|(token, _), _| sessions.contains_key(token));

        let deleted = initial_len - tables.sessions.len();
        debug!(deleted, "deleted expired sessions");
        Ok(deleted)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, Error> {
        self.tables
            .lock()
            .map_err(|_| Error::store("memory store lock poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("session_lifetime", &self.session_lifetime)
            .finish_non_exhaustive()
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, Error> {
        let guard = self.lock()?;
        let staged = guard.clone();

        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            session_lifetime: self.session_lifetime,
        }))
    }
}

struct MemoryTransaction<'s> {
    guard: MutexGuard<'s, Tables>,
    staged: Tables,
    session_lifetime: Duration,
}

impl Transaction for MemoryTransaction<'_> {
    fn find_live_session(&mut self, token: Uuid, now: DateTime<Utc>) -> Result<Option<Session>, Error> {
        Ok(self
            .staged
            .sessions
            .get(&token)
            .filter(|session| session.is_live(now))
            .cloned())
    }

    fn find_user(&mut self, user_id: Uuid) -> Result<Option<User>, Error> {
        Ok(self.staged.users.get(&user_id).cloned())
    }

    fn create_session(&mut self, new: &NewSession) -> Result<Session, Error> {
        let now = Utc::now();
        let session = Session {
            token: Uuid::new_v4(),
            user_id: new.user_id,
            expires: now + self.session_lifetime,
            news_message: new.news_message.clone(),
            redirect_to_url: new.redirect_to_url.clone(),
            inserted: now,
            updated: now,
        };

        self.staged.sessions.insert(session.token, session.clone());
        Ok(session)
    }

    fn extend_session(&mut self, token: Uuid, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        let lifetime = self.session_lifetime;

        Ok(self
            .staged
            .sessions
            .get_mut(&token)
            .filter(|session| session.is_live(now))
            .map(|session| {
                session.expires = now + lifetime;
                session.updated = now;
                session.expires
            }))
    }

    fn session_data(&mut self, token: Uuid, namespace: &str) -> Result<Option<Value>, Error> {
        Ok(self
            .staged
            .session_data
            .get(&(token, namespace.to_owned()))
            .cloned())
    }

    fn set_session_data(&mut self, token: Uuid, namespace: &str, data: Value) -> Result<(), Error> {
        self.staged
            .session_data
            .insert((token, namespace.to_owned()), data);
        Ok(())
    }

    fn delete_session_data(&mut self, token: Uuid, namespace: &str) -> Result<(), Error> {
        self.staged
            .session_data
            .remove(&(token, namespace.to_owned()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), Error> {
        let MemoryTransaction {
            mut guard, staged, ..
        } = *self;

        *guard = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::sample_user;

    #[test]
    fn commit_publishes_writes() {
        let store = MemoryStore::new();
        store.insert_user(sample_user()).unwrap();

        let mut tx = store.begin().unwrap();
        let session = tx
            .create_session(&NewSession::for_user(sample_user().user_id).news_message("hi"))
            .unwrap();
        tx.set_session_data(session.token, "global", serde_json::json!({"a": 1}))
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let found = tx.find_live_session(session.token, Utc::now()).unwrap();
        assert_eq!(found, Some(session.clone()));
        assert_eq!(
            tx.find_user(sample_user().user_id).unwrap(),
            Some(sample_user())
        );
        assert_eq!(
            tx.session_data(session.token, "global").unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        tx.rollback().unwrap();
    }

    #[test]
    fn rollback_discards_writes() {
        let store = MemoryStore::new();

        let mut tx = store.begin().unwrap();
        let session = tx.create_session(&NewSession::default()).unwrap();
        tx.rollback().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.find_live_session(session.token, Utc::now()).unwrap(), None);
        tx.rollback().unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn expired_sessions() {
        let store = MemoryStore::with_session_lifetime(Duration::minutes(10));

        let mut tx = store.begin().unwrap();
        let session = tx.create_session(&NewSession::default()).unwrap();
        tx.set_session_data(session.token, "global", serde_json::json!(1))
            .unwrap();
        tx.commit().unwrap();

        let later = Utc::now() + Duration::minutes(11);
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.find_live_session(session.token, later).unwrap(), None);
        assert_eq!(tx.extend_session(session.token, later).unwrap(), None);

        let soon = Utc::now() + Duration::minutes(5);
        let extended = tx.extend_session(session.token, soon).unwrap();
        assert_eq!(extended, Some(soon + Duration::minutes(10)));
        tx.rollback().unwrap();

        assert_eq!(store.cleanup().unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn cleanup_drops_dead_sessions() {
        let store = MemoryStore::with_session_lifetime(Duration::seconds(-1));

        let mut tx = store.begin().unwrap();
        let session = tx.create_session(&NewSession::default()).unwrap();
        tx.set_session_data(session.token, "global", serde_json::json!(1))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(store.cleanup().unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }
}
