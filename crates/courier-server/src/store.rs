//! Shared handle to the SQLite database.
//!
//! `rusqlite::Connection` is not `Sync`, so the server keeps one connection
//! behind a mutex. Every store call is a short synchronous statement; the
//! mutex is never held across an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use courier_store::{Database, StoreError};

use crate::error::ServerError;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Open the configured database file, or the platform default.
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let db = match path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Ok(Self::new(db))
    }

    /// Run `f` against the database.
    pub fn call<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, ServerError> {
        let db = self
            .db
            .lock()
            .map_err(|_| ServerError::Internal("database mutex poisoned".into()))?;
        f(&db).map_err(ServerError::from)
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(Some(&dir.path().join("courier.db"))).unwrap();
    (dir, store)
}
