//! Content-addressable response cache
//!
//! Caches analysis responses keyed by a SHA-256 over the call's subject
//! scope and normalized content, so identical change content skips the
//! provider round-trip. Entries are partitioned by review subject to make
//! bulk invalidation cheap.
//!
//! Writes across every cache instance in the process share one sliding
//! window rate limiter; a write the limiter rejects is dropped and logged,
//! never surfaced. A cache failure is a missed optimization, not an error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::analysis::AnalysisResponse;
use crate::storage::{KvEntry, KvStore};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long entries stay readable
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Writes admitted per rolling minute, shared process-wide
    pub max_writes_per_minute: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 3600),
            max_writes_per_minute: 60,
        }
    }
}

/// A cached analysis response with bookkeeping.
///
/// `hit_count` starts at 0 on the initial store and counts real hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Content hash the entry is stored under
    pub key: String,
    /// Path scope for narrow invalidation, when the call had one
    pub path: Option<String>,
    /// The cached response
    pub payload: AnalysisResponse,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// After this instant the entry is unreadable
    pub expires_at: DateTime<Utc>,
    /// Times the entry has been served
    pub hit_count: u64,
    /// Last read or write
    pub last_accessed_at: DateTime<Utc>,
}

/// Observability counters and partition census
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub dropped_writes: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    /// Readable entries in the inspected partition
    pub active_entries: usize,
    /// Expired-but-unswept entries in the inspected partition
    pub expired_entries: usize,
    /// Cost of the calls the cache absorbed
    pub avoided_cost: f64,
}

/// Deterministic cache key over a subject scope and normalized content
pub fn cache_key(scope: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize content for keying: CRLF to LF, trailing whitespace stripped
fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Sliding-window write admission, shared by all caches in the process
#[derive(Debug, Default)]
pub struct WriteRateLimiter {
    window: Mutex<VecDeque<Instant>>,
}

static SHARED_LIMITER: LazyLock<Arc<WriteRateLimiter>> =
    LazyLock::new(|| Arc::new(WriteRateLimiter::default()));

const WINDOW: Duration = Duration::from_secs(60);

impl WriteRateLimiter {
    /// The process-wide limiter instance
    pub fn shared() -> Arc<WriteRateLimiter> {
        Arc::clone(&SHARED_LIMITER)
    }

    /// Try to admit one write under the given per-minute limit
    pub fn try_acquire(&self, limit: usize) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            window.pop_front();
        }
        if window.len() < limit {
            window.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Content-addressable cache of analysis responses over a [`KvStore`]
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
    limiter: Arc<WriteRateLimiter>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    dropped_writes: AtomicU64,
    /// Cumulative avoided cost in milli-units, so it fits an atomic
    avoided_cost_milli: AtomicU64,
}

impl ResponseCache {
    /// Create a cache sharing the process-wide write limiter
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self::with_limiter(store, config, WriteRateLimiter::shared())
    }

    /// Create a cache with its own limiter (tests use this for isolation)
    pub fn with_limiter(
        store: Arc<dyn KvStore>,
        config: CacheConfig,
        limiter: Arc<WriteRateLimiter>,
    ) -> Self {
        Self {
            store,
            config,
            limiter,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
            avoided_cost_milli: AtomicU64::new(0),
        }
    }

    /// Look up a cached response.
    ///
    /// Expired entries are deleted opportunistically and count as misses.
    /// Hits bump the entry's hit count and access time, best effort.
    pub async fn get(&self, subject: &str, key: &str) -> Option<AnalysisResponse> {
        let partition = partition_for(subject);
        let entry = match self.store.get(&partition, key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(err) => {
                warn!(error = %err, "cache read failed, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut cached: CacheEntry = match serde_json::from_value(entry.payload) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(error = %err, "cache entry undecodable, dropping");
                let _ = self.store.delete(&partition, key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let now = Utc::now();
        if now >= cached.expires_at {
            debug!(key, "cache entry expired, deleting");
            if let Err(err) = self.store.delete(&partition, key).await {
                warn!(error = %err, "failed to delete expired cache entry");
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.avoided_cost_milli.fetch_add(
            (cached.payload.usage.cost * 1000.0) as u64,
            Ordering::Relaxed,
        );

        cached.hit_count += 1;
        cached.last_accessed_at = now;
        let payload = cached.payload.clone();
        if let Ok(value) = serde_json::to_value(&cached) {
            let refreshed = KvEntry {
                payload: value,
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            };
            if let Err(err) = self.store.put(&partition, key, refreshed).await {
                warn!(error = %err, "failed to refresh cache entry bookkeeping");
            }
        }

        Some(payload)
    }

    /// Store a response.
    ///
    /// Silently dropped when the shared write limiter rejects it or the
    /// store write fails; the caller never sees a cache error.
    pub async fn put(
        &self,
        subject: &str,
        key: &str,
        path: Option<&str>,
        payload: &AnalysisResponse,
    ) {
        if !self.limiter.try_acquire(self.config.max_writes_per_minute) {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache write dropped by rate limiter");
            return;
        }

        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.config.ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(6));
        let cached = CacheEntry {
            key: key.to_string(),
            path: path.map(str::to_string),
            payload: payload.clone(),
            created_at: now,
            expires_at,
            hit_count: 0,
            last_accessed_at: now,
        };

        let value = match serde_json::to_value(&cached) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "cache entry unserializable, skipping write");
                return;
            }
        };

        let entry = KvEntry {
            payload: value,
            created_at: now,
            expires_at: Some(expires_at),
        };
        match self.store.put(&partition_for(subject), key, entry).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(error = %err, "cache write failed, continuing without it");
            }
        }
    }

    /// Bulk delete a subject's entries, optionally narrowed to one path
    pub async fn invalidate(&self, subject: &str, path: Option<&str>) -> usize {
        let partition = partition_for(subject);
        match path {
            None => match self.store.delete_partition(&partition).await {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(error = %err, "cache invalidation failed");
                    0
                }
            },
            Some(path) => {
                let rows = match self.store.query_partition(&partition).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(error = %err, "cache invalidation scan failed");
                        return 0;
                    }
                };
                let mut removed = 0;
                for (row, entry) in rows {
                    let matches = serde_json::from_value::<CacheEntry>(entry.payload)
                        .map(|c| c.path.as_deref() == Some(path))
                        .unwrap_or(false);
                    if matches && self.store.delete(&partition, &row).await.is_ok() {
                        removed += 1;
                    }
                }
                removed
            }
        }
    }

    /// Counters plus an active/expired census of the subject's partition
    pub async fn statistics(&self, subject: &str) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let mut stats = CacheStatistics {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            avoided_cost: self.avoided_cost_milli.load(Ordering::Relaxed) as f64 / 1000.0,
            ..Default::default()
        };

        if let Ok(rows) = self.store.query_partition(&partition_for(subject)).await {
            let now = Utc::now();
            for (_, entry) in rows {
                match entry.expires_at {
                    Some(expires) if now >= expires => stats.expired_entries += 1,
                    _ => stats.active_entries += 1,
                }
            }
        }

        stats
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.config.ttl)
            .field("max_writes_per_minute", &self.config.max_writes_per_minute)
            .finish_non_exhaustive()
    }
}

/// Partition name for a review subject
fn partition_for(subject: &str) -> String {
    format!("cache-{}", subject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Finding, Recommendation, Severity, Usage};
    use crate::storage::MemoryStore;

    fn response(cost: f64) -> AnalysisResponse {
        AnalysisResponse {
            findings: vec![Finding {
                file: "src/a.rs".to_string(),
                line: 3,
                category: "style".to_string(),
                severity: Severity::Low,
                message: "nit".to_string(),
            }],
            recommendation: Recommendation::Comment,
            summary: "one nit".to_string(),
            usage: Usage { cost, tokens: 100 },
        }
    }

    fn isolated_cache(config: CacheConfig) -> ResponseCache {
        ResponseCache::with_limiter(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(WriteRateLimiter::default()),
        )
    }

    #[test]
    fn test_key_deterministic_and_content_sensitive() {
        let a = cache_key("o/r#1::src/a.rs", "+ fn new()\n");
        let b = cache_key("o/r#1::src/a.rs", "+ fn new()\n");
        let c = cache_key("o/r#1::src/a.rs", "+ fn other()\n");
        let d = cache_key("o/r#1::src/b.rs", "+ fn new()\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_key_normalizes_line_endings_and_trailing_space() {
        let a = cache_key("scope", "line one  \r\nline two\r\n");
        let b = cache_key("scope", "line one\nline two\n");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = isolated_cache(CacheConfig::default());
        let key = cache_key("o/r#1", "content");

        assert!(cache.get("o/r#1", &key).await.is_none());
        cache.put("o/r#1", &key, Some("src/a.rs"), &response(0.5)).await;

        let cached = cache.get("o/r#1", &key).await.unwrap();
        assert_eq!(cached.findings.len(), 1);
        assert_eq!(cached.summary, "one nit");
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_deleted() {
        let cache = isolated_cache(CacheConfig {
            ttl: Duration::from_millis(20),
            ..Default::default()
        });
        let key = cache_key("o/r#1", "content");
        cache.put("o/r#1", &key, None, &response(0.5)).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("o/r#1", &key).await.is_none());

        let stats = cache.statistics("o/r#1").await;
        assert_eq!(stats.active_entries, 0);
        assert_eq!(stats.expired_entries, 0); // opportunistically deleted
    }

    #[tokio::test]
    async fn test_hit_count_starts_at_zero_and_counts_hits() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::with_limiter(
            store.clone(),
            CacheConfig::default(),
            Arc::new(WriteRateLimiter::default()),
        );
        let key = cache_key("o/r#1", "content");
        cache.put("o/r#1", &key, None, &response(0.5)).await;

        let raw = store.get("cache-o/r#1", &key).await.unwrap().unwrap();
        let cached: CacheEntry = serde_json::from_value(raw.payload).unwrap();
        assert_eq!(cached.hit_count, 0);

        cache.get("o/r#1", &key).await.unwrap();
        cache.get("o/r#1", &key).await.unwrap();

        let raw = store.get("cache-o/r#1", &key).await.unwrap().unwrap();
        let cached: CacheEntry = serde_json::from_value(raw.payload).unwrap();
        assert_eq!(cached.hit_count, 2);
    }

    #[tokio::test]
    async fn test_writes_beyond_rate_limit_dropped_silently() {
        let cache = isolated_cache(CacheConfig {
            max_writes_per_minute: 2,
            ..Default::default()
        });

        for i in 0..5 {
            let key = cache_key("o/r#1", &format!("content-{}", i));
            cache.put("o/r#1", &key, None, &response(0.1)).await;
        }

        let stats = cache.statistics("o/r#1").await;
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.dropped_writes, 3);
        assert_eq!(stats.active_entries, 2);
    }

    #[tokio::test]
    async fn test_limiter_is_shared_across_instances() {
        let limiter = Arc::new(WriteRateLimiter::default());
        let cache_a = ResponseCache::with_limiter(
            Arc::new(MemoryStore::new()),
            CacheConfig {
                max_writes_per_minute: 2,
                ..Default::default()
            },
            limiter.clone(),
        );
        let cache_b = ResponseCache::with_limiter(
            Arc::new(MemoryStore::new()),
            CacheConfig {
                max_writes_per_minute: 2,
                ..Default::default()
            },
            limiter,
        );

        cache_a.put("s", "k1", None, &response(0.1)).await;
        cache_a.put("s", "k2", None, &response(0.1)).await;
        // The window is full; the other instance's write is dropped too.
        cache_b.put("s", "k3", None, &response(0.1)).await;

        assert_eq!(cache_b.statistics("s").await.dropped_writes, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_subject_and_path() {
        let cache = isolated_cache(CacheConfig::default());
        cache.put("o/r#1", "k1", Some("src/a.rs"), &response(0.1)).await;
        cache.put("o/r#1", "k2", Some("src/b.rs"), &response(0.1)).await;
        cache.put("o/r#2", "k3", Some("src/a.rs"), &response(0.1)).await;

        let removed = cache.invalidate("o/r#1", Some("src/a.rs")).await;
        assert_eq!(removed, 1);
        assert!(cache.get("o/r#1", "k1").await.is_none());
        assert!(cache.get("o/r#1", "k2").await.is_some());

        let removed = cache.invalidate("o/r#1", None).await;
        assert_eq!(removed, 1);
        assert!(cache.get("o/r#2", "k3").await.is_some());
    }

    #[tokio::test]
    async fn test_statistics_track_avoided_cost() {
        let cache = isolated_cache(CacheConfig::default());
        let key = cache_key("o/r#1", "content");
        cache.put("o/r#1", &key, None, &response(0.75)).await;

        cache.get("o/r#1", &key).await.unwrap();
        cache.get("o/r#1", &key).await.unwrap();

        let stats = cache.statistics("o/r#1").await;
        assert_eq!(stats.hits, 2);
        assert!((stats.avoided_cost - 1.5).abs() < 1e-9);
        assert!(stats.hit_rate > 0.99);
    }
}
