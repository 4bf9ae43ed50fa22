//! Durable key-value storage interface backing the ledger and cache
//!
//! Entries are addressed by a (partition, row) key pair. Expiry is data the
//! store carries but does not act on by itself; retention is enforced by an
//! external sweep (see the database crate's purge).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::Result;

/// A stored value with its bookkeeping columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    /// Opaque JSON payload
    pub payload: serde_json::Value,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Expiry horizon, if any
    pub expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    /// Create an entry timestamped now
    pub fn new(payload: serde_json::Value, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            payload,
            created_at: Utc::now(),
            expires_at,
        }
    }
}

/// Partition+row keyed storage
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a single entry
    async fn get(&self, partition: &str, row: &str) -> Result<Option<KvEntry>>;

    /// Insert or replace a single entry
    async fn put(&self, partition: &str, row: &str, entry: KvEntry) -> Result<()>;

    /// Delete a single entry; deleting a missing entry is not an error
    async fn delete(&self, partition: &str, row: &str) -> Result<()>;

    /// List all entries in a partition as (row, entry) pairs
    async fn query_partition(&self, partition: &str) -> Result<Vec<(String, KvEntry)>>;

    /// Delete every entry in a partition, returning how many were removed
    async fn delete_partition(&self, partition: &str) -> Result<usize>;
}

/// In-memory store used by tests and as the zero-setup default
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, BTreeMap<String, KvEntry>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, partition: &str, row: &str) -> Result<Option<KvEntry>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .and_then(|rows| rows.get(row))
            .cloned())
    }

    async fn put(&self, partition: &str, row: &str, entry: KvEntry) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(partition.to_string())
            .or_default()
            .insert(row.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, partition: &str, row: &str) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        if let Some(rows) = partitions.get_mut(partition) {
            rows.remove(row);
        }
        Ok(())
    }

    async fn query_partition(&self, partition: &str) -> Result<Vec<(String, KvEntry)>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .map(|rows| {
                rows.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_partition(&self, partition: &str) -> Result<usize> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .remove(partition)
            .map(|rows| rows.len())
            .unwrap_or(0))
    }
}
