//! `SQLite` backing for the local snapshot cache.
//!
//! One row per session holds the latest full snapshot, so an attempt survives a
//! process restart or crash even while the remote store is unreachable.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use thiserror::Error;

use crate::repository::{LocalCache, Storage};

mod cache_repo;
mod migrate;

/// Snapshot cache over a pooled `SQLite` database. Clones share the pool.
#[derive(Clone)]
pub struct SqliteSnapshotCache {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqliteInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl SqliteSnapshotCache {
    /// Open the snapshot database at `database_url` in WAL mode, so a snapshot write
    /// never blocks a concurrent restore.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the database cannot be opened or a pragma fails.
    pub async fn connect(database_url: &str) -> Result<Self, SqliteInitError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode = WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout = 5000;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bring the snapshot table up to the current schema. Safe to run on every start.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if a schema step fails.
    pub async fn migrate(&self) -> Result<(), SqliteInitError> {
        migrate::run_migrations(&self.pool).await
    }
}

impl Storage {
    /// Open (creating if needed) the snapshot cache at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the database cannot be opened or migrated.
    pub async fn sqlite(database_url: &str) -> Result<Self, SqliteInitError> {
        let repo = SqliteSnapshotCache::connect(database_url).await?;
        repo.migrate().await?;
        let cache: Arc<dyn LocalCache> = Arc::new(repo);
        Ok(Self { cache })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SqliteSnapshotCache>();
    }

    #[tokio::test]
    async fn storage_opens_a_migrated_cache() {
        let storage = Storage::sqlite("sqlite:file:memdb_storage_open?mode=memory&cache=shared")
            .await
            .expect("open");
        assert!(storage.cache.list_snapshots().await.expect("list").is_empty());
    }
}
