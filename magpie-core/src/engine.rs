//! Top-level review engine
//!
//! Wires the control flow together: deduplication gate, semaphore-gated
//! diff retrieval, extraction, dispatch, and ledger outcome recording. The
//! duplicate check runs before any expensive work so re-delivered requests
//! short-circuit cheaply. Only a total failure to read the change set
//! surfaces as an operation failure; everything else degrades.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::analysis::{AnalysisService, AnalysisUnit};
use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::cache::{CacheStatistics, ResponseCache};
use crate::config::EngineConfig;
use crate::dedup::{fingerprint, DeduplicationLedger};
use crate::diff::DiffExtractor;
use crate::dispatch::{AggregateResult, ReviewDispatcher, WorkItem};
use crate::provider::SourceChangeProvider;
use crate::retry::retry;
use crate::storage::KvStore;
use crate::Result;

/// What fired the review request.
///
/// Deliberately not part of the request fingerprint: different triggers
/// for the same change are the same unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A change was opened for review
    Opened,
    /// New revisions were pushed to an open change
    Synchronized,
    /// A human asked for a (re-)review
    Manual,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Opened => write!(f, "opened"),
            TriggerKind::Synchronized => write!(f, "synchronized"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

/// One incoming review request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    /// Review subject, e.g. "owner/repo#42"
    pub subject_id: String,
    /// Source revision under review (head commit)
    pub source_revision: String,
    /// What fired the request
    pub trigger: TriggerKind,
}

impl ReviewRequest {
    /// Create a request
    pub fn new(
        subject_id: impl Into<String>,
        source_revision: impl Into<String>,
        trigger: TriggerKind,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            source_revision: source_revision.into(),
            trigger,
        }
    }
}

/// Result of handling a review request
#[derive(Debug)]
pub enum ReviewOutcome {
    /// The request was processed and aggregated
    Completed(AggregateResult),
    /// The request duplicated an earlier delivery; nothing was processed
    Duplicate {
        /// Outcome recorded for the earlier delivery, when available
        outcome_summary: Option<String>,
    },
}

/// Review orchestration engine
pub struct ReviewEngine {
    config: EngineConfig,
    provider: Arc<dyn SourceChangeProvider>,
    ledger: DeduplicationLedger,
    cache: Arc<ResponseCache>,
    dispatcher: ReviewDispatcher,
    registry: Arc<BreakerRegistry>,
    semaphore: Arc<Semaphore>,
    extractor: DiffExtractor,
}

impl ReviewEngine {
    /// Create an engine over the given collaborators, using the
    /// process-wide breaker registry
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn SourceChangeProvider>,
        service: Arc<dyn AnalysisService>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self::with_registry(config, provider, service, store, BreakerRegistry::global())
    }

    /// Create an engine with an explicit breaker registry (tests use this
    /// for isolation)
    pub fn with_registry(
        config: EngineConfig,
        provider: Arc<dyn SourceChangeProvider>,
        service: Arc<dyn AnalysisService>,
        store: Arc<dyn KvStore>,
        registry: Arc<BreakerRegistry>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_reviews.max(1)));
        let ledger = DeduplicationLedger::new(Arc::clone(&store), config.dedup.clone());
        let cache = Arc::new(ResponseCache::new(Arc::clone(&store), config.cache.clone()));
        let dispatcher = ReviewDispatcher::new(
            service,
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&semaphore),
            &config,
        );

        Self {
            config,
            provider,
            ledger,
            cache,
            dispatcher,
            registry,
            semaphore,
            extractor: DiffExtractor::new(),
        }
    }

    /// Handle one review request end to end.
    ///
    /// Duplicates short-circuit with the recorded outcome. Individual
    /// fetch or analysis failures degrade into counted placeholders; the
    /// only hard failure is being unable to read the change set at all.
    pub async fn review(&self, request: &ReviewRequest) -> Result<ReviewOutcome> {
        let fp = fingerprint(&request.subject_id, &request.source_revision);

        let (duplicate, outcome_summary) = self.ledger.is_duplicate(&fp).await;
        if duplicate {
            info!(
                subject = %request.subject_id,
                trigger = %request.trigger,
                "duplicate delivery short-circuited"
            );
            return Ok(ReviewOutcome::Duplicate { outcome_summary });
        }
        self.ledger.record(&fp).await;

        let paths = match retry(&self.config.retry, || {
            self.provider.list_changed_paths(&request.subject_id)
        })
        .await
        {
            Ok(paths) => paths,
            Err(err) => {
                self.ledger
                    .update_outcome(&fp, &format!("failed: {}", err))
                    .await;
                return Err(err);
            }
        };
        info!(
            subject = %request.subject_id,
            paths = paths.len(),
            "change set listed"
        );

        let (items, fetch_failures) = self.fetch_work_items(request, paths).await;

        let mut aggregate = self.dispatcher.dispatch(&request.subject_id, items).await;
        aggregate.absorb_failed_items(fetch_failures);

        let summary = aggregate.summary();
        self.ledger.update_outcome(&fp, &summary).await;
        info!(subject = %request.subject_id, summary = %summary, "review complete");

        Ok(ReviewOutcome::Completed(aggregate))
    }

    /// Fetch and parse each changed path under the shared gate.
    ///
    /// One path's failure never aborts its siblings; it is counted and the
    /// rest proceed. Paths whose diffs contain no changed lines are
    /// dropped.
    async fn fetch_work_items(
        &self,
        request: &ReviewRequest,
        paths: Vec<String>,
    ) -> (Vec<WorkItem>, usize) {
        let mut tasks: JoinSet<(String, Result<String>)> = JoinSet::new();
        for path in paths {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&self.semaphore);
            let retry_policy = self.config.retry.clone();
            let subject = request.subject_id.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let err = crate::Error::Other("concurrency gate closed".to_string());
                        return (path, Err(err));
                    }
                };
                let result = retry(&retry_policy, || provider.fetch_diff(&subject, &path)).await;
                (path, result)
            });
        }

        let mut items = Vec::new();
        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, Ok(diff_text))) => {
                    let hunks = self.extractor.parse(&diff_text);
                    if hunks.is_empty() {
                        continue;
                    }
                    let cost = DiffExtractor::estimate_cost(&hunks);
                    let unit = AnalysisUnit::item(&request.subject_id, &path, hunks);
                    items.push(WorkItem::new(path, cost, unit));
                }
                Ok((path, Err(err))) => {
                    warn!(path = %path, error = %err, "diff fetch failed, skipping path");
                    failures += 1;
                }
                Err(err) => {
                    warn!(error = %err, "diff fetch task aborted");
                    failures += 1;
                }
            }
        }
        (items, failures)
    }

    /// Breaker snapshots for health reporting
    pub async fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.registry.snapshots().await
    }

    /// Administratively reset one breaker; false when it does not exist
    pub async fn reset_breaker(&self, service: &str) -> Result<bool> {
        self.registry.reset(service).await
    }

    /// Cache statistics for one subject's partition
    pub async fn cache_statistics(&self, subject: &str) -> CacheStatistics {
        self.cache.statistics(subject).await
    }

    /// Invalidate cached responses for a subject, optionally one path
    pub async fn invalidate_cache(&self, subject: &str, path: Option<&str>) -> usize {
        self.cache.invalidate(subject, path).await
    }

    /// The engine's configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for ReviewEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewEngine")
            .field("max_concurrent_reviews", &self.config.max_concurrent_reviews)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResponse, Finding, Recommendation, Severity, Usage};
    use crate::storage::MemoryStore;
    use crate::Error;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider serving canned diffs from a map
    struct FakeProvider {
        diffs: HashMap<String, String>,
        fail_listing: bool,
        list_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(diffs: &[(&str, &str)]) -> Self {
            Self {
                diffs: diffs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                fail_listing: false,
                list_calls: AtomicUsize::new(0),
            }
        }

        fn unlistable() -> Self {
            Self {
                diffs: HashMap::new(),
                fail_listing: true,
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceChangeProvider for FakeProvider {
        async fn list_changed_paths(&self, _subject: &str) -> Result<Vec<String>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing {
                return Err(Error::transient("provider unreachable"));
            }
            let mut paths: Vec<String> = self.diffs.keys().cloned().collect();
            paths.sort();
            Ok(paths)
        }

        async fn fetch_diff(&self, _subject: &str, path: &str) -> Result<String> {
            self.diffs
                .get(path)
                .cloned()
                .ok_or_else(|| Error::transient(format!("no diff for {}", path)))
        }
    }

    /// Analysis service returning one low-severity finding per call
    struct FakeService {
        calls: AtomicUsize,
    }

    impl FakeService {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalysisService for FakeService {
        async fn analyze(&self, unit: &AnalysisUnit) -> Result<AnalysisResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AnalysisResponse {
                findings: vec![Finding {
                    file: unit.scope(),
                    line: 1,
                    category: "style".to_string(),
                    severity: Severity::Low,
                    message: "nit".to_string(),
                }],
                recommendation: Recommendation::Comment,
                summary: "ok".to_string(),
                usage: Usage {
                    cost: 0.01,
                    tokens: 10,
                },
            })
        }
    }

    fn diff_for(path: &str) -> String {
        format!(
            "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1,2 +1,2 @@\n ctx\n-old {path}\n+new {path}\n"
        )
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 1;
        config.retry.base_delay = std::time::Duration::from_millis(1);
        config
    }

    fn engine_with(provider: FakeProvider, service: Arc<FakeService>) -> ReviewEngine {
        ReviewEngine::with_registry(
            fast_config(),
            Arc::new(provider),
            service,
            Arc::new(MemoryStore::new()),
            Arc::new(BreakerRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_review_completes_and_aggregates() {
        let a = diff_for("src/a.rs");
        let b = diff_for("src/b.rs");
        let provider = FakeProvider::new(&[("src/a.rs", &a), ("src/b.rs", &b)]);
        let service = Arc::new(FakeService::new());
        let engine = engine_with(provider, service);

        let request = ReviewRequest::new("o/r#1", "sha1", TriggerKind::Opened);
        let outcome = engine.review(&request).await.unwrap();

        let ReviewOutcome::Completed(aggregate) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(aggregate.item_count, 2);
        assert_eq!(aggregate.failed_item_count, 0);
        assert_eq!(aggregate.recommendation, Recommendation::Comment);
    }

    #[tokio::test]
    async fn test_second_delivery_is_duplicate_with_outcome() {
        let a = diff_for("src/a.rs");
        let provider = FakeProvider::new(&[("src/a.rs", &a)]);
        let service = Arc::new(FakeService::new());
        let engine = engine_with(provider, service.clone());

        let opened = ReviewRequest::new("o/r#1", "sha1", TriggerKind::Opened);
        engine.review(&opened).await.unwrap();
        let calls_after_first = service.calls.load(Ordering::SeqCst);

        // Same subject and revision, different trigger: still a duplicate.
        let synchronized = ReviewRequest::new("o/r#1", "sha1", TriggerKind::Synchronized);
        let outcome = engine.review(&synchronized).await.unwrap();

        let ReviewOutcome::Duplicate { outcome_summary } = outcome else {
            panic!("expected duplicate");
        };
        assert!(outcome_summary.unwrap().contains("comment"));
        assert_eq!(service.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn test_new_revision_is_not_duplicate() {
        let a = diff_for("src/a.rs");
        let provider = FakeProvider::new(&[("src/a.rs", &a)]);
        let service = Arc::new(FakeService::new());
        let engine = engine_with(provider, service);

        engine
            .review(&ReviewRequest::new("o/r#1", "sha1", TriggerKind::Opened))
            .await
            .unwrap();
        let outcome = engine
            .review(&ReviewRequest::new("o/r#1", "sha2", TriggerKind::Synchronized))
            .await
            .unwrap();
        assert!(matches!(outcome, ReviewOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_unreadable_change_set_is_operation_failure() {
        let engine = engine_with(FakeProvider::unlistable(), Arc::new(FakeService::new()));
        let request = ReviewRequest::new("o/r#1", "sha1", TriggerKind::Opened);
        assert!(engine.review(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_failures_counted_not_fatal() {
        // The listing names a path the fetch cannot serve; that path is
        // counted as failed while its sibling is reviewed normally.
        struct ListingProvider {
            inner: FakeProvider,
        }
        #[async_trait]
        impl SourceChangeProvider for ListingProvider {
            async fn list_changed_paths(&self, _subject: &str) -> Result<Vec<String>> {
                Ok(vec!["src/a.rs".to_string(), "src/missing.rs".to_string()])
            }
            async fn fetch_diff(&self, subject: &str, path: &str) -> Result<String> {
                self.inner.fetch_diff(subject, path).await
            }
        }

        let a = diff_for("src/a.rs");
        let engine = ReviewEngine::with_registry(
            fast_config(),
            Arc::new(ListingProvider {
                inner: FakeProvider::new(&[("src/a.rs", &a)]),
            }),
            Arc::new(FakeService::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(BreakerRegistry::new()),
        );

        let request = ReviewRequest::new("o/r#1", "sha1", TriggerKind::Opened);
        let outcome = engine.review(&request).await.unwrap();
        let ReviewOutcome::Completed(aggregate) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(aggregate.failed_item_count, 1);
        assert_eq!(aggregate.item_count, 2);
    }

    #[tokio::test]
    async fn test_empty_change_set_trivially_approved() {
        let provider = FakeProvider::new(&[]);
        let engine = engine_with(provider, Arc::new(FakeService::new()));
        let request = ReviewRequest::new("o/r#1", "sha1", TriggerKind::Manual);

        let outcome = engine.review(&request).await.unwrap();
        let ReviewOutcome::Completed(aggregate) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(aggregate.recommendation, Recommendation::Approve);
        assert_eq!(aggregate.item_count, 0);
    }
}
