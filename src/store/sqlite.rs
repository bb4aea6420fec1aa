//! SQLite-backed [`SnapshotStore`] (feature `sqlite`).
//!
//! Records are stored as JSON bodies keyed by their natural ids; the
//! snapshot version is additionally denormalized into its own column so the
//! optimistic `update` guard can run as a single conditional `UPDATE`.
//! Wait-condition updates run inside a transaction, which under SQLite's
//! serialized writers makes the read-modify-write atomic per correlation id.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::progress::ForEachProgress;
use crate::snapshot::FlowSnapshot;
use crate::wait::{BranchSignal, RecordOutcome, WaitCondition, WaitUpdate};

use super::{SnapshotStore, StoreError};

/// [`SnapshotStore`] over a SQLite database file (or `sqlite::memory:`).
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

fn db(source: sqlx::Error) -> StoreError {
    StoreError::backend(source.to_string())
}

impl SqliteSnapshotStore {
    /// Opens (creating if missing) the database at `database_url` and
    /// ensures the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wraps an already-configured pool. The schema must exist or be
    /// created by the caller via [`ensure_schema`](Self::ensure_schema).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flow_snapshots (
                flow_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                body    TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wait_conditions (
                correlation_id TEXT PRIMARY KEY,
                body           TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS foreach_progress (
                flow_id TEXT NOT NULL,
                step    TEXT NOT NULL,
                body    TEXT NOT NULL,
                PRIMARY KEY (flow_id, step)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn create(&self, snapshot: &FlowSnapshot) -> Result<bool, StoreError> {
        let body = serde_json::to_string(snapshot)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO flow_snapshots (flow_id, version, body) VALUES (?1, ?2, ?3)",
        )
        .bind(&snapshot.flow_id)
        .bind(snapshot.version as i64)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError> {
        let row = sqlx::query("SELECT body FROM flow_snapshots WHERE flow_id = ?1")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => {
                let body: String = row.try_get("body").map_err(db)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, snapshot: &FlowSnapshot) -> Result<bool, StoreError> {
        let mut next = snapshot.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        let body = serde_json::to_string(&next)?;
        let result = sqlx::query(
            "UPDATE flow_snapshots SET version = ?1, body = ?2
             WHERE flow_id = ?3 AND version = ?4",
        )
        .bind(next.version as i64)
        .bind(&body)
        .bind(&snapshot.flow_id)
        .bind(snapshot.version as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM flow_snapshots WHERE flow_id = ?1")
            .bind(flow_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_wait_condition(&self, condition: &WaitCondition) -> Result<(), StoreError> {
        let body = serde_json::to_string(condition)?;
        sqlx::query(
            "INSERT INTO wait_conditions (correlation_id, body) VALUES (?1, ?2)
             ON CONFLICT(correlation_id) DO UPDATE SET body = excluded.body",
        )
        .bind(&condition.correlation_id)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn wait_condition(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WaitCondition>, StoreError> {
        let row = sqlx::query("SELECT body FROM wait_conditions WHERE correlation_id = ?1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => {
                let body: String = row.try_get("body").map_err(db)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn update_wait_condition(
        &self,
        correlation_id: &str,
        signal: BranchSignal,
    ) -> Result<WaitUpdate, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let row = sqlx::query("SELECT body FROM wait_conditions WHERE correlation_id = ?1")
            .bind(correlation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        let Some(row) = row else {
            return Err(StoreError::UnknownWait {
                correlation_id: correlation_id.to_string(),
            });
        };
        let body: String = row.try_get("body").map_err(db)?;
        let mut condition: WaitCondition = serde_json::from_str(&body)?;

        let branch_id = signal.branch_id.clone();
        match condition.record(signal) {
            RecordOutcome::UnknownBranch => {
                return Err(StoreError::UnknownBranch {
                    correlation_id: correlation_id.to_string(),
                    branch_id,
                });
            }
            RecordOutcome::Recorded => {
                let body = serde_json::to_string(&condition)?;
                sqlx::query("UPDATE wait_conditions SET body = ?1 WHERE correlation_id = ?2")
                    .bind(&body)
                    .bind(correlation_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
            }
            RecordOutcome::Duplicate => {}
        }
        tx.commit().await.map_err(db)?;

        Ok(WaitUpdate {
            is_complete: condition.is_resolved(),
            results: condition.results,
        })
    }

    async fn clear_wait_condition(&self, correlation_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wait_conditions WHERE correlation_id = ?1")
            .bind(correlation_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn timed_out_wait_conditions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WaitCondition>, StoreError> {
        // Timeout math stays in Rust so the stored body remains the single
        // source of truth for the schema.
        let rows = sqlx::query("SELECT body FROM wait_conditions")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let mut expired = Vec::new();
        for row in rows {
            let body: String = row.try_get("body").map_err(db)?;
            let condition: WaitCondition = serde_json::from_str(&body)?;
            if !condition.is_resolved() && condition.timed_out_at(now) {
                expired.push(condition);
            }
        }
        Ok(expired)
    }

    async fn save_foreach_progress(&self, progress: &ForEachProgress) -> Result<(), StoreError> {
        let body = serde_json::to_string(progress)?;
        sqlx::query(
            "INSERT INTO foreach_progress (flow_id, step, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(flow_id, step) DO UPDATE SET body = excluded.body",
        )
        .bind(&progress.flow_id)
        .bind(&progress.step)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn foreach_progress(
        &self,
        flow_id: &str,
        step: &str,
    ) -> Result<Option<ForEachProgress>, StoreError> {
        let row = sqlx::query("SELECT body FROM foreach_progress WHERE flow_id = ?1 AND step = ?2")
            .bind(flow_id)
            .bind(step)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => {
                let body: String = row.try_get("body").map_err(db)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn clear_foreach_progress(&self, flow_id: &str, step: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM foreach_progress WHERE flow_id = ?1 AND step = ?2")
            .bind(flow_id)
            .bind(step)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}
