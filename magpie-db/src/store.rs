//! SQLite-backed KV store
//!
//! Implements the core [`KvStore`] interface over the `kv_entries` table
//! and carries the retention sweep that enforces TTLs: expired rows and
//! deduplication partitions older than the retention horizon are deleted
//! in bulk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use magpie_core::storage::{KvEntry, KvStore};
use magpie_core::Error as CoreError;

/// Row shape of the `kv_entries` table
#[derive(Debug, sqlx::FromRow)]
struct KvRow {
    payload: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl KvRow {
    fn into_entry(self) -> Result<KvEntry, CoreError> {
        Ok(KvEntry {
            payload: serde_json::from_str(&self.payload)?,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// Partition+row keyed storage over SQLite
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store over an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Retention sweep: delete rows past their expiry and dedup partitions
    /// older than the horizon. Returns how many rows were removed.
    pub async fn purge_expired(&self, retention_days: u32) -> Result<u64, CoreError> {
        let now = Utc::now();

        let expired = sqlx::query(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected();

        // Dedup partitions are named dedup-YYYYMMDD; everything strictly
        // older than the horizon can go wholesale.
        let horizon = now
            .date_naive()
            .checked_sub_days(chrono::Days::new(retention_days.into()))
            .map(magpie_core::dedup::partition_for);

        let mut aged = 0;
        if let Some(horizon) = horizon {
            aged = sqlx::query(
                "DELETE FROM kv_entries WHERE partition_key LIKE 'dedup-%' AND partition_key < ?",
            )
            .bind(&horizon)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();
        }

        info!(expired, aged, "retention sweep complete");
        Ok(expired + aged)
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, partition: &str, row: &str) -> magpie_core::Result<Option<KvEntry>> {
        let found: Option<KvRow> = sqlx::query_as(
            "SELECT payload, created_at, expires_at FROM kv_entries \
             WHERE partition_key = ? AND row_key = ?",
        )
        .bind(partition)
        .bind(row)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        found.map(KvRow::into_entry).transpose()
    }

    async fn put(&self, partition: &str, row: &str, entry: KvEntry) -> magpie_core::Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        sqlx::query(
            "INSERT OR REPLACE INTO kv_entries \
             (partition_key, row_key, payload, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(partition)
        .bind(row)
        .bind(payload)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, partition: &str, row: &str) -> magpie_core::Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE partition_key = ? AND row_key = ?")
            .bind(partition)
            .bind(row)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn query_partition(
        &self,
        partition: &str,
    ) -> magpie_core::Result<Vec<(String, KvEntry)>> {
        let rows: Vec<(String, String, DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT row_key, payload, created_at, expires_at FROM kv_entries \
             WHERE partition_key = ? ORDER BY row_key",
        )
        .bind(partition)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for (row_key, payload, created_at, expires_at) in rows {
            entries.push((
                row_key,
                KvEntry {
                    payload: serde_json::from_str(&payload)?,
                    created_at,
                    expires_at,
                },
            ));
        }
        Ok(entries)
    }

    async fn delete_partition(&self, partition: &str) -> magpie_core::Result<usize> {
        let affected = sqlx::query("DELETE FROM kv_entries WHERE partition_key = ?")
            .bind(partition)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();
        debug!(partition, removed = affected, "partition deleted");
        Ok(affected as usize)
    }
}

fn storage_err(err: sqlx::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}
