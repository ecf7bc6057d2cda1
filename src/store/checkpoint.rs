//! Per-consumer checkpoints
//!
//! Each log consumer (projector, ledger pump) remembers the highest seq it
//! has applied under its own name, enabling at-most-once, restartable
//! consumption.

use chrono::Utc;
use sqlx::SqlitePool;

use super::StoreResult;

#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Last applied seq for `name`; 0 when the consumer has never run.
    pub async fn get(&self, name: &str) -> StoreResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_seq FROM checkpoint_store WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(seq,)| seq).unwrap_or(0))
    }

    /// Advance (or reset) the checkpoint for `name`.
    pub async fn set(&self, name: &str, last_seq: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoint_store (name, last_seq, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                last_seq = excluded.last_seq,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(last_seq)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
