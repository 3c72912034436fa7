//! Persistent manifest cache.
//!
//! Entries are keyed by the canonical form of the manuscript URL (lower-cased,
//! fragment stripped, trailing slashes trimmed) and tagged with
//! [`CACHE_VERSION`]. Opening the cache drops entries written by an older
//! version. Reads never fail: a broken, stale or expired entry is removed and
//! reported as a miss.

use std::time::Duration;

use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::Database;
use crate::manifest::{Manifest, ResolveError};
use crate::queue::now_millis;

/// Bump when the stored manifest shape changes.
pub const CACHE_VERSION: i64 = 1;

/// Errors from cache writes and maintenance.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The manifest failed validation and was not stored.
    #[error("refusing to cache manifest: {0}")]
    Rejected(#[from] ResolveError),
}

/// Canonical cache key for a manuscript URL.
#[must_use]
pub fn canonical_key(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment
        .trim()
        .trim_end_matches('/')
        .to_lowercase()
}

fn read_row(row: &SqliteRow) -> Result<(String, i64, i64), sqlx::Error> {
    Ok((
        row.try_get("manifest_json")?,
        row.try_get("cached_at")?,
        row.try_get("version")?,
    ))
}

/// Manifest cache stored in the state database.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    db: Database,
    ttl: Option<Duration>,
}

impl ManifestCache {
    /// Opens the cache and purges entries from older cache versions.
    ///
    /// `ttl` of `None` keeps entries until they are invalidated.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the purge fails.
    pub async fn open(db: Database, ttl: Option<Duration>) -> Result<Self, CacheError> {
        let purged = sqlx::query("DELETE FROM manifest_cache WHERE version < ?")
            .bind(CACHE_VERSION)
            .execute(db.pool())
            .await?
            .rows_affected();
        if purged > 0 {
            info!(purged, version = CACHE_VERSION, "dropped manifests cached by an older version");
        }
        Ok(Self { db, ttl })
    }

    /// Returns the cached manifest for `url`, or `None` on a miss.
    #[instrument(skip(self))]
    pub async fn get(&self, url: &str) -> Option<Manifest> {
        let key = canonical_key(url);
        let row = match sqlx::query(
            "SELECT manifest_json, cached_at, version FROM manifest_cache WHERE cache_key = ?",
        )
        .bind(&key)
        .fetch_optional(self.db.pool())
        .await
        {
            Ok(row) => row?,
            Err(e) => {
                warn!(error = %e, "manifest cache read failed");
                return None;
            }
        };

        let Ok((json, cached_at, version)) = read_row(&row) else {
            self.evict(&key, "unreadable row").await;
            return None;
        };

        if version != CACHE_VERSION {
            self.evict(&key, "version mismatch").await;
            return None;
        }
        if let Some(ttl) = self.ttl {
            let age_ms = now_millis().saturating_sub(cached_at);
            if u128::try_from(age_ms).unwrap_or(0) > ttl.as_millis() {
                self.evict(&key, "expired").await;
                return None;
            }
        }
        match serde_json::from_str::<Manifest>(&json) {
            Ok(manifest) if manifest.validate().is_ok() => Some(manifest),
            _ => {
                self.evict(&key, "invalid manifest").await;
                None
            }
        }
    }

    /// Stores `manifest` under `url` after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Rejected`] for an invalid manifest, or a
    /// database/serialization error.
    #[instrument(skip(self, manifest), fields(pages = manifest.pages.len()))]
    pub async fn put(&self, url: &str, manifest: &Manifest) -> Result<(), CacheError> {
        manifest.validate()?;
        let json = serde_json::to_string(manifest)?;
        sqlx::query(
            r"INSERT INTO manifest_cache (cache_key, source_url, manifest_json, cached_at, version)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT(cache_key) DO UPDATE SET
                source_url = excluded.source_url,
                manifest_json = excluded.manifest_json,
                cached_at = excluded.cached_at,
                version = excluded.version",
        )
        .bind(canonical_key(url))
        .bind(url)
        .bind(json)
        .bind(now_millis())
        .bind(CACHE_VERSION)
        .execute(self.db.pool())
        .await?;
        debug!("manifest cached");
        Ok(())
    }

    /// Removes the entry for `url`. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the delete fails.
    pub async fn invalidate(&self, url: &str) -> Result<bool, CacheError> {
        let result = sqlx::query("DELETE FROM manifest_cache WHERE cache_key = ?")
            .bind(canonical_key(url))
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes every entry. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the delete fails.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM manifest_cache")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn evict(&self, key: &str, reason: &str) {
        debug!(key, reason, "evicting cached manifest");
        if let Err(e) = sqlx::query("DELETE FROM manifest_cache WHERE cache_key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await
        {
            warn!(key, error = %e, "failed to evict cached manifest");
        }
    }
}
