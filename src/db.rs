//! State database.
//!
//! The retry queue and the manifest cache share one `SQLite` file under the
//! state directory. The schema lives in `migrations/` and is applied on open.
//!
//! # Example
//!
//! ```no_run
//! use mss_core::{Database, RetryQueue};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("state.db")).await?;
//! let queue = RetryQueue::persistent(db.clone());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// `SQLite` locks the whole file for writes; a few connections are enough.
const MAX_CONNECTIONS: u32 = 5;

/// Connections wait this long on a locked file before returning `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// State database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to open state database: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("failed to migrate state database: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Shared handle to the state database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the state database at `db_path` in WAL mode and
    /// brings its schema up to date.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be opened or migrated.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// In-memory database with the full schema, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the schema cannot be created.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        // One connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("state database ready");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
