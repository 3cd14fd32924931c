//! Persistence for connections, recurring tasks, execution logs and
//! scheduled emails, plus keychain slots for process secrets.
//!
//! The core only sees the store traits in [`stores`]; [`SqliteStore`]
//! implements all three over one [`Database`].

mod database;
mod keychain;
pub mod queries;
mod schema;
pub mod stores;

pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError, SecretSlot};
pub use stores::{
    ConnectionStore, ScheduledEmailStore, SqliteStore, StoreError, StoreResult, TaskStore,
};

use std::path::Path;
use std::sync::Arc;

/// An opened database with its shared store.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    store: Arc<SqliteStore>,
}

impl StorageLayer {
    /// Opens the database file at `db_path`, migrating it if needed.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::wrap(Database::open(db_path).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::wrap(Database::open_in_memory().await?))
    }

    fn wrap(db: Database) -> Self {
        Self {
            store: Arc::new(SqliteStore::new(db)),
        }
    }

    pub fn db(&self) -> &Database {
        self.store.db()
    }

    /// The store backing every store trait; clones share the connection.
    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }
}
