use exam_core::model::SessionId;
use sqlx::Row;

use super::SqliteSnapshotCache;
use crate::records::LocalSnapshot;
use crate::repository::{LocalCache, StorageError};

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

fn revision_i64(v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization("revision overflow".into()))
}

#[async_trait::async_trait]
impl LocalCache for SqliteSnapshotCache {
    async fn save_snapshot(&self, snapshot: &LocalSnapshot) -> Result<(), StorageError> {
        let body = serde_json::to_string(snapshot).map_err(ser)?;

        // The WHERE clause keeps an already cached newer revision in place.
        sqlx::query(
            r"
                INSERT INTO session_snapshots (
                    session_id, revision, is_paused, last_active_at, saved_at, snapshot
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(session_id) DO UPDATE SET
                    revision = excluded.revision,
                    is_paused = excluded.is_paused,
                    last_active_at = excluded.last_active_at,
                    saved_at = excluded.saved_at,
                    snapshot = excluded.snapshot
                WHERE excluded.revision >= session_snapshots.revision
            ",
        )
        .bind(snapshot.session_id().to_string())
        .bind(revision_i64(snapshot.revision())?)
        .bind(snapshot.is_paused())
        .bind(snapshot.last_active_timestamp())
        .bind(snapshot.saved_at)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn load_snapshot(&self, id: SessionId) -> Result<LocalSnapshot, StorageError> {
        let row = sqlx::query("SELECT snapshot FROM session_snapshots WHERE session_id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;

        let body: String = row.try_get("snapshot").map_err(ser)?;
        serde_json::from_str(&body).map_err(ser)
    }

    async fn delete_snapshot(&self, id: SessionId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM session_snapshots WHERE session_id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SessionId>, StorageError> {
        let rows = sqlx::query("SELECT session_id FROM session_snapshots ORDER BY saved_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("session_id").map_err(ser)?;
                raw.parse::<SessionId>().map_err(ser)
            })
            .collect()
    }
}
