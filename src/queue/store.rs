//! Storage seam for the retry queue.
//!
//! [`RetryQueue`](super::RetryQueue) depends on [`RetryStore`] so the same
//! queue logic runs against process memory or the state database.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{DownloadTask, Result};

/// Data-access contract for retry queue persistence.
///
/// Implementations keep tasks unique per `(source_url, page_index)` and list
/// them in first-insertion order.
#[async_trait]
pub trait RetryStore: Send + Sync + std::fmt::Debug {
    /// Inserts `task`, or updates the existing task with the same key in place.
    async fn upsert(&self, task: &DownloadTask) -> Result<()>;

    /// Returns every task in insertion order.
    async fn list(&self) -> Result<Vec<DownloadTask>>;

    /// Removes one task. Returns `true` if it existed.
    async fn remove(&self, source_url: &str, page_index: usize) -> Result<bool>;

    /// Removes every task. Returns the number removed.
    async fn clear(&self) -> Result<u64>;

    /// Removes tasks whose source URL contains `fragment`. Returns the number removed.
    async fn clear_matching(&self, fragment: &str) -> Result<u64>;
}

/// Process-local store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryRetryStore {
    tasks: Mutex<Vec<DownloadTask>>,
}

impl MemoryRetryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DownloadTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn upsert(&self, task: &DownloadTask) -> Result<()> {
        let mut tasks = self.lock();
        match tasks
            .iter_mut()
            .find(|t| t.page_index == task.page_index && t.source_url == task.source_url)
        {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DownloadTask>> {
        Ok(self.lock().clone())
    }

    async fn remove(&self, source_url: &str, page_index: usize) -> Result<bool> {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|t| !(t.page_index == page_index && t.source_url == source_url));
        Ok(tasks.len() != before)
    }

    async fn clear(&self) -> Result<u64> {
        let mut tasks = self.lock();
        let removed = tasks.len() as u64;
        tasks.clear();
        Ok(removed)
    }

    async fn clear_matching(&self, fragment: &str) -> Result<u64> {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|t| !t.source_url.contains(fragment));
        Ok((before - tasks.len()) as u64)
    }
}
