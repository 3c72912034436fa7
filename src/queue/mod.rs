//! Retry queue for pages whose most recent fetch did not yield a verified image.
//!
//! # Overview
//!
//! The queue system consists of:
//! - [`RetryQueue`] - Main interface, shared by the fetcher and the engine
//! - [`DownloadTask`] - One failed page with its attempt history
//! - [`RetryStore`] - Storage seam, with [`MemoryRetryStore`] and [`SqliteRetryStore`]
//! - [`QueueError`] - Operation error types
//!
//! Tasks are keyed by `(source_url, page_index)`. Re-enqueueing a key updates
//! the task in place and keeps its position. Nothing expires on its own: a
//! task leaves the queue when its page is fetched successfully or when the
//! queue is cleared.
//!
//! # Example
//!
//! ```ignore
//! use mss_core::queue::{DownloadTask, RetryQueue};
//!
//! let queue = RetryQueue::in_memory();
//! queue.enqueue(DownloadTask::new(3, "https://example.org/p3.jpg")).await?;
//!
//! for task in queue.dequeue_all().await? {
//!     // ... fetch task.source_url again ...
//!     queue.remove(&task.source_url, task.page_index).await?;
//! }
//! ```

mod error;
mod sqlite;
mod store;

pub use error::{QueueDbErrorKind, QueueError};
pub use sqlite::SqliteRetryStore;
pub use store::{MemoryRetryStore, RetryStore};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A page that still needs a verified image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub page_index: usize,
    pub source_url: String,
    /// Attempts made so far across the fetch and every sweep.
    pub attempt_count: u32,
    /// Unix epoch milliseconds of the most recent attempt.
    pub last_attempt_at: i64,
    pub last_error: Option<String>,
    /// IIIF size rung reached (0 = original size).
    pub quality_level: usize,
    /// Egress path of the most recent attempt.
    pub egress: Option<String>,
}

impl DownloadTask {
    /// Creates a task with no attempts recorded yet.
    #[must_use]
    pub fn new(page_index: usize, source_url: impl Into<String>) -> Self {
        Self {
            page_index,
            source_url: source_url.into(),
            attempt_count: 0,
            last_attempt_at: now_millis(),
            last_error: None,
            quality_level: 0,
            egress: None,
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub size: usize,
    pub items: Vec<DownloadTask>,
}

/// Shared retry queue. Cloning yields another handle to the same store.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    store: Arc<dyn RetryStore>,
}

impl RetryQueue {
    /// Creates a queue over any store.
    #[must_use]
    pub fn new(store: Arc<dyn RetryStore>) -> Self {
        Self { store }
    }

    /// Creates a process-local queue.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRetryStore::new()))
    }

    /// Creates a queue persisted in the state database.
    #[must_use]
    pub fn persistent(db: Database) -> Self {
        Self::new(Arc::new(SqliteRetryStore::new(db)))
    }

    /// Records `task`, replacing any task with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store write fails.
    #[instrument(skip(self, task), fields(url = %task.source_url, page_index = task.page_index, attempts = task.attempt_count))]
    pub async fn enqueue(&self, task: DownloadTask) -> Result<()> {
        self.store.upsert(&task).await?;
        debug!("task recorded in retry queue");
        Ok(())
    }

    /// Returns a snapshot of all tasks in insertion order.
    ///
    /// Tasks stay in the queue; remove them with [`Self::remove`] once their
    /// page has been fetched.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the store read fails.
    pub async fn dequeue_all(&self) -> Result<Vec<DownloadTask>> {
        self.store.list().await
    }

    /// Removes the task for `(source_url, page_index)`. Returns `true` if present.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store write fails.
    #[instrument(skip(self), fields(url = %source_url))]
    pub async fn remove(&self, source_url: &str, page_index: usize) -> Result<bool> {
        let removed = self.store.remove(source_url, page_index).await?;
        if removed {
            debug!(page_index, "task removed from retry queue");
        }
        Ok(removed)
    }

    /// Removes every task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store write fails.
    pub async fn clear(&self) -> Result<u64> {
        self.store.clear().await
    }

    /// Removes tasks whose URL contains `fragment` (e.g. a manuscript id).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store write fails.
    pub async fn clear_matching(&self, fragment: &str) -> Result<u64> {
        self.store.clear_matching(fragment).await
    }

    /// Returns the queue size and every task with its attempt history.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the store read fails.
    pub async fn status(&self) -> Result<QueueStatus> {
        let items = self.store.list().await?;
        Ok(QueueStatus {
            size: items.len(),
            items,
        })
    }

    /// Number of queued tasks.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the store read fails.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.list().await?.len())
    }

    /// Returns `true` if no task is queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the store read fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
