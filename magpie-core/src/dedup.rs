//! Deduplication ledger for review requests
//!
//! Webhook deliveries are at-least-once and several trigger types can fire
//! for the same underlying change, so requests are fingerprinted over
//! subject identity and source revision only. Records live in date-bucketed
//! partitions so an external retention sweep can drop whole days at once.
//!
//! Every ledger operation fails open: a storage error is logged and treated
//! as "no duplicate" rather than blocking the review itself.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::storage::{KvEntry, KvStore};
use crate::Result;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How many daily buckets a duplicate lookup probes
    pub retention_days: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

/// One tracked request fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Stable request fingerprint
    pub fingerprint: String,
    /// When the fingerprint was first seen
    pub first_seen_at: chrono::DateTime<Utc>,
    /// Most recent sighting or update
    pub last_seen_at: chrono::DateTime<Utc>,
    /// Deliveries observed for this fingerprint
    pub attempt_count: u32,
    /// What happened to the request ("processing" until completion)
    pub outcome_summary: String,
}

/// Stable fingerprint for a logical review request.
///
/// Deliberately excludes the trigger/event type so different triggers for
/// the same change collapse to one unit of work.
pub fn fingerprint(subject_id: &str, source_revision: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(source_revision.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprinted request tracking over a [`KvStore`]
#[derive(Clone)]
pub struct DeduplicationLedger {
    store: Arc<dyn KvStore>,
    config: DedupConfig,
}

impl DeduplicationLedger {
    /// Create a ledger over the given store
    pub fn new(store: Arc<dyn KvStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Check whether this fingerprint was already seen inside the retention
    /// horizon.
    ///
    /// Returns the recorded outcome summary for duplicates. Storage errors
    /// fail open: logged, reported as not-duplicate.
    pub async fn is_duplicate(&self, fp: &str) -> (bool, Option<String>) {
        match self.find(fp).await {
            Ok(Some((_, record))) => (true, Some(record.outcome_summary)),
            Ok(None) => (false, None),
            Err(err) => {
                warn!(error = %err, "dedup lookup failed, treating as not duplicate");
                (false, None)
            }
        }
    }

    /// Record a sighting of this fingerprint.
    ///
    /// First sighting creates the record in today's bucket with outcome
    /// "processing"; re-deliveries bump `last_seen_at` and the attempt
    /// count in the bucket where the record first landed.
    pub async fn record(&self, fp: &str) {
        if let Err(err) = self.record_inner(fp).await {
            warn!(error = %err, "dedup record failed, continuing without ledger entry");
        }
    }

    /// Update the outcome after processing completes (or fails)
    pub async fn update_outcome(&self, fp: &str, summary: &str) {
        if let Err(err) = self.update_outcome_inner(fp, summary).await {
            warn!(error = %err, "dedup outcome update failed");
        }
    }

    async fn record_inner(&self, fp: &str) -> Result<()> {
        let now = Utc::now();
        let (partition, record) = match self.find(fp).await? {
            Some((partition, mut record)) => {
                record.last_seen_at = now;
                record.attempt_count += 1;
                (partition, record)
            }
            None => (
                partition_for(now.date_naive()),
                DedupRecord {
                    fingerprint: fp.to_string(),
                    first_seen_at: now,
                    last_seen_at: now,
                    attempt_count: 1,
                    outcome_summary: "processing".to_string(),
                },
            ),
        };
        self.write(&partition, &record).await
    }

    async fn update_outcome_inner(&self, fp: &str, summary: &str) -> Result<()> {
        let Some((partition, mut record)) = self.find(fp).await? else {
            // The record may have been lost to a failed write; recreate it
            // so a later duplicate still learns the outcome.
            let now = Utc::now();
            let record = DedupRecord {
                fingerprint: fp.to_string(),
                first_seen_at: now,
                last_seen_at: now,
                attempt_count: 1,
                outcome_summary: summary.to_string(),
            };
            return self.write(&partition_for(now.date_naive()), &record).await;
        };
        record.last_seen_at = Utc::now();
        record.outcome_summary = summary.to_string();
        self.write(&partition, &record).await
    }

    /// Probe the daily buckets inside the retention horizon, newest first
    async fn find(&self, fp: &str) -> Result<Option<(String, DedupRecord)>> {
        let today = Utc::now().date_naive();
        for days_back in 0..self.config.retention_days.max(1) {
            let Some(date) = today.checked_sub_days(chrono::Days::new(days_back.into())) else {
                break;
            };
            let partition = partition_for(date);
            if let Some(entry) = self.store.get(&partition, fp).await? {
                let record: DedupRecord = serde_json::from_value(entry.payload)?;
                return Ok(Some((partition, record)));
            }
        }
        Ok(None)
    }

    async fn write(&self, partition: &str, record: &DedupRecord) -> Result<()> {
        let entry = KvEntry::new(serde_json::to_value(record)?, None);
        self.store.put(partition, &record.fingerprint, entry).await
    }
}

impl std::fmt::Debug for DeduplicationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationLedger")
            .field("retention_days", &self.config.retention_days)
            .finish_non_exhaustive()
    }
}

/// Partition name for a creation date, e.g. `dedup-20260807`
pub fn partition_for(date: NaiveDate) -> String {
    format!("dedup-{}", date.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::{Error, KvEntry};
    use async_trait::async_trait;

    fn ledger() -> DeduplicationLedger {
        DeduplicationLedger::new(Arc::new(MemoryStore::new()), DedupConfig::default())
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint("owner/repo#42", "abc123");
        let b = fingerprint("owner/repo#42", "abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        assert_ne!(
            fingerprint("owner/repo#42", "abc123"),
            fingerprint("owner/repo#42", "def456")
        );
        assert_ne!(
            fingerprint("owner/repo#42", "abc123"),
            fingerprint("owner/repo#43", "abc123")
        );
        // Concatenation ambiguity: the separator keeps these apart.
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
    }

    #[tokio::test]
    async fn test_first_sighting_is_not_duplicate() {
        let ledger = ledger();
        let fp = fingerprint("o/r#1", "rev1");
        let (dup, outcome) = ledger.is_duplicate(&fp).await;
        assert!(!dup);
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_second_delivery_reports_recorded_outcome() {
        let ledger = ledger();
        let fp = fingerprint("o/r#1", "rev1");

        ledger.record(&fp).await;
        ledger.update_outcome(&fp, "approve: 0 findings").await;

        let (dup, outcome) = ledger.is_duplicate(&fp).await;
        assert!(dup);
        assert_eq!(outcome.as_deref(), Some("approve: 0 findings"));
    }

    #[tokio::test]
    async fn test_redelivery_increments_attempts_and_keeps_first_seen() {
        let store = Arc::new(MemoryStore::new());
        let ledger = DeduplicationLedger::new(store.clone(), DedupConfig::default());
        let fp = fingerprint("o/r#1", "rev1");

        ledger.record(&fp).await;
        ledger.record(&fp).await;
        ledger.record(&fp).await;

        let (_, record) = ledger.find(&fp).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 3);
        assert!(record.first_seen_at <= record.last_seen_at);
    }

    #[tokio::test]
    async fn test_different_triggers_same_fingerprint() {
        // Two deliveries for the same (subject, revision) but different
        // event types collapse: the fingerprint ignores the trigger.
        let ledger = ledger();
        let fp_opened = fingerprint("o/r#7", "sha999");
        let fp_synchronized = fingerprint("o/r#7", "sha999");
        assert_eq!(fp_opened, fp_synchronized);

        ledger.record(&fp_opened).await;
        ledger.update_outcome(&fp_opened, "comment: 2 findings").await;

        let (dup, outcome) = ledger.is_duplicate(&fp_synchronized).await;
        assert!(dup);
        assert_eq!(outcome.as_deref(), Some("comment: 2 findings"));
    }

    /// Store that fails every operation, for fail-open coverage
    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _: &str, _: &str) -> Result<Option<KvEntry>> {
            Err(Error::Storage("store offline".to_string()))
        }
        async fn put(&self, _: &str, _: &str, _: KvEntry) -> Result<()> {
            Err(Error::Storage("store offline".to_string()))
        }
        async fn delete(&self, _: &str, _: &str) -> Result<()> {
            Err(Error::Storage("store offline".to_string()))
        }
        async fn query_partition(&self, _: &str) -> Result<Vec<(String, KvEntry)>> {
            Err(Error::Storage("store offline".to_string()))
        }
        async fn delete_partition(&self, _: &str) -> Result<usize> {
            Err(Error::Storage("store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let ledger = DeduplicationLedger::new(Arc::new(BrokenStore), DedupConfig::default());
        let fp = fingerprint("o/r#1", "rev1");

        let (dup, outcome) = ledger.is_duplicate(&fp).await;
        assert!(!dup);
        assert!(outcome.is_none());

        // Writes must not propagate errors either.
        ledger.record(&fp).await;
        ledger.update_outcome(&fp, "done").await;
    }

    #[test]
    fn test_partition_name_format() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();
        assert_eq!(partition_for(date), "dedup-20260807");
    }
}
