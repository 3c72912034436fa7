//! `SQLite`-backed retry store.
//!
//! Tasks live in the `retry_queue` table. `inserted_seq` is assigned on first
//! insert and left alone by updates, so listing by it preserves insertion
//! order across restarts.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;

use super::store::RetryStore;
use super::{DownloadTask, QueueError, Result};
use crate::db::Database;

/// Retry store persisted in the state database.
#[derive(Debug, Clone)]
pub struct SqliteRetryStore {
    db: Database,
}

impl SqliteRetryStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_task(row: &SqliteRow) -> Result<DownloadTask> {
    let source_url: String = row.try_get("source_url")?;
    let corrupt = |reason: &str| QueueError::CorruptRow {
        source_url: source_url.clone(),
        reason: reason.to_string(),
    };

    let page_index: i64 = row.try_get("page_index")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let quality_level: i64 = row.try_get("quality_level")?;

    Ok(DownloadTask {
        page_index: usize::try_from(page_index).map_err(|_| corrupt("page_index out of range"))?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| corrupt("attempt_count out of range"))?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_error: row.try_get("last_error")?,
        quality_level: usize::try_from(quality_level)
            .map_err(|_| corrupt("quality_level out of range"))?,
        egress: row.try_get("egress")?,
        source_url,
    })
}

#[async_trait]
impl RetryStore for SqliteRetryStore {
    #[instrument(skip(self, task), fields(url = %task.source_url, page_index = task.page_index))]
    async fn upsert(&self, task: &DownloadTask) -> Result<()> {
        sqlx::query(
            r"INSERT INTO retry_queue
                (source_url, page_index, attempt_count, last_attempt_at, last_error,
                 quality_level, egress, inserted_seq)
              VALUES (?, ?, ?, ?, ?, ?, ?,
                 (SELECT COALESCE(MAX(inserted_seq), 0) + 1 FROM retry_queue))
              ON CONFLICT(source_url, page_index) DO UPDATE SET
                attempt_count = excluded.attempt_count,
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error,
                quality_level = excluded.quality_level,
                egress = excluded.egress",
        )
        .bind(&task.source_url)
        .bind(to_i64(task.page_index))
        .bind(i64::from(task.attempt_count))
        .bind(task.last_attempt_at)
        .bind(task.last_error.as_deref())
        .bind(to_i64(task.quality_level))
        .bind(task.egress.as_deref())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DownloadTask>> {
        let rows = sqlx::query(
            "SELECT source_url, page_index, attempt_count, last_attempt_at, last_error, \
             quality_level, egress FROM retry_queue ORDER BY inserted_seq ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn remove(&self, source_url: &str, page_index: usize) -> Result<bool> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE source_url = ? AND page_index = ?")
            .bind(source_url)
            .bind(to_i64(page_index))
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM retry_queue")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_matching(&self, fragment: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE instr(source_url, ?) > 0")
            .bind(fragment)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
