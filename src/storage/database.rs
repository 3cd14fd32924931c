//! SQLite handle shared by the stores.
//!
//! One connection sits behind a `tokio::sync::Mutex`; every closure runs on
//! the blocking pool with the lock held. The schema version is tracked in
//! `PRAGMA user_version` so reopening a file only applies new migrations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {found} is newer than this build ({supported})")]
    SchemaTooNew { found: usize, supported: usize },

    #[error("could not encode column: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
}

/// Applies every migration past the stored `user_version` in one transaction.
/// Returns how many were applied.
fn migrate(conn: &mut Connection) -> Result<usize> {
    let migrations = schema::all_migrations();
    let current: usize = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > migrations.len() {
        return Err(DatabaseError::SchemaTooNew {
            found: current,
            supported: migrations.len(),
        });
    }

    let pending = &migrations[current..];
    if pending.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    for sql in pending {
        tx.execute_batch(sql)?;
    }
    tx.pragma_update(None, "user_version", migrations.len())?;
    tx.commit()?;
    Ok(pending.len())
}

/// Cloneable handle; clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) a database file in WAL mode and migrates it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::connect(move || {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            debug!(path = %path.display(), "Opened database");
            Ok(conn)
        })
        .await
    }

    /// Opens a private in-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect(|| Ok(Connection::open_in_memory()?)).await
    }

    async fn connect<F>(opener: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Connection> + Send + 'static,
    {
        let (conn, applied) = blocking(move || {
            let mut conn = opener()?;
            conn.pragma_update(None, "foreign_keys", true)?;
            let applied = migrate(&mut conn)?;
            Ok((conn, applied))
        })
        .await?;
        if applied > 0 {
            info!(applied, "Applied database migrations");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || f(&conn.blocking_lock())).await
    }

    /// Runs `f` inside a transaction that commits only if `f` succeeds.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
