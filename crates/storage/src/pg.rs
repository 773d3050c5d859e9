//! Postgres-backed [`ConsumptionStore`].

use crate::{ConsumedLogKey, ConsumptionStore, StorageError};
use alloy_primitives::B256;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use tracing::debug;

/// DDL for the consumption table. Safe to execute repeatedly.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS log_consumptions (
        block_hash BYTEA NOT NULL,
        log_index BIGINT NOT NULL,
        job_id TEXT NOT NULL,
        block_number BIGINT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS log_consumptions_unique_idx
        ON log_consumptions (block_hash, log_index, job_id)",
    "CREATE INDEX IF NOT EXISTS log_consumptions_block_number_idx
        ON log_consumptions (block_number)",
];

/// A [`ConsumptionStore`] persisting to a Postgres `log_consumptions` table.
#[derive(Debug, Clone)]
pub struct PgConsumptionStore {
    pool: PgPool,
}

impl PgConsumptionStore {
    /// Creates a store over an existing connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url` and creates the schema if needed.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let store = Self::new(PgPool::connect(url).await?);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Creates the `log_consumptions` table and its indexes if absent.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(target: "storage", "Ensured log_consumptions schema");
        Ok(())
    }

    /// Returns the underlying connection pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i64(column: &'static str, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::OutOfRange { column, value })
}

#[async_trait]
impl ConsumptionStore for PgConsumptionStore {
    async fn was_broadcast_consumed(
        &self,
        block_hash: B256,
        log_index: u64,
        job_id: &str,
    ) -> Result<bool, StorageError> {
        let consumed: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM log_consumptions
                WHERE block_hash = $1 AND log_index = $2 AND job_id = $3
            )",
        )
        .bind(block_hash.as_slice())
        .bind(to_i64("log_index", log_index)?)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(consumed)
    }

    async fn mark_broadcast_consumed(
        &self,
        block_hash: B256,
        block_number: u64,
        log_index: u64,
        job_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO log_consumptions (block_hash, log_index, job_id, block_number)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (block_hash, log_index, job_id) DO NOTHING",
        )
        .bind(block_hash.as_slice())
        .bind(to_i64("log_index", log_index)?)
        .bind(job_id)
        .bind(to_i64("block_number", block_number)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_consumed_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<HashSet<ConsumedLogKey>, StorageError> {
        let rows = sqlx::query(
            "SELECT block_hash, log_index, job_id FROM log_consumptions
             WHERE block_number >= $1 AND block_number <= $2",
        )
        .bind(to_i64("block_number", from_block)?)
        .bind(to_i64("block_number", to_block)?)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let hash_bytes: Vec<u8> = row.try_get("block_hash")?;
            let block_hash = B256::try_from(hash_bytes.as_slice())
                .map_err(|_| StorageError::MalformedBlockHash(hash_bytes.len()))?;
            let log_index: i64 = row.try_get("log_index")?;
            let job_id: String = row.try_get("job_id")?;
            keys.insert(ConsumedLogKey { block_hash, log_index: log_index as u64, job_id });
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires a reachable Postgres instance; run with
    /// `DATABASE_URL=postgres://... cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires postgres"]
    async fn round_trips_consumptions() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgConsumptionStore::connect(&url).await.expect("connect");

        let block_hash = B256::repeat_byte(0xab);
        assert!(!store.was_broadcast_consumed(block_hash, 3, "job-pg").await.unwrap());

        store.mark_broadcast_consumed(block_hash, 42, 3, "job-pg").await.unwrap();
        // Second mark is a no-op, not a unique violation.
        store.mark_broadcast_consumed(block_hash, 42, 3, "job-pg").await.unwrap();

        assert!(store.was_broadcast_consumed(block_hash, 3, "job-pg").await.unwrap());

        let consumed = store.find_consumed_logs(40, 45).await.unwrap();
        assert!(consumed.contains(&ConsumedLogKey {
            block_hash,
            log_index: 3,
            job_id: "job-pg".into()
        }));
    }
}
