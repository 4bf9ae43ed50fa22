//! Strategy-selecting concurrent review dispatcher
//!
//! Picks an execution strategy from the work item count and total cost
//! estimate, fans the calls out under the shared concurrency gate, and
//! aggregates with tolerance for partial failure. Every external call is
//! checked against the response cache first, wrapped by the analysis
//! service's circuit breaker on a miss, and written back on success.

mod aggregate;

pub use aggregate::{AggregateResult, MAX_TOTAL_COST, MAX_TOTAL_TOKENS};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisResponse, AnalysisService, AnalysisUnit};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::{cache_key, ResponseCache};
use crate::config::EngineConfig;
use crate::diff::ChangedHunk;
use crate::retry::{retry, RetryPolicy};
use crate::{Error, Result};

/// Execution strategy picked per dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStrategy {
    /// One call covering every item
    SinglePass,
    /// One call per item category
    Chunked,
    /// Per-item calls, then cross-item correlation over severe results
    Hierarchical,
}

impl std::fmt::Display for ReviewStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStrategy::SinglePass => write!(f, "single_pass"),
            ReviewStrategy::Chunked => write!(f, "chunked"),
            ReviewStrategy::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

/// Strategy selection thresholds: two ascending (items, cost) pairs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// At most this many items for a single pass
    pub single_pass_max_items: usize,
    /// At most this much estimated cost for a single pass
    pub single_pass_max_cost: u32,
    /// At most this many items for chunked execution
    pub chunked_max_items: usize,
    /// At most this much estimated cost for chunked execution
    pub chunked_max_cost: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            single_pass_max_items: 5,
            single_pass_max_cost: 400,
            chunked_max_items: 15,
            chunked_max_cost: 2_000,
        }
    }
}

/// Pick a strategy from the item count and total cost estimate
pub fn select_strategy(
    config: &DispatchConfig,
    item_count: usize,
    total_cost: u32,
) -> ReviewStrategy {
    if item_count <= config.single_pass_max_items && total_cost <= config.single_pass_max_cost {
        ReviewStrategy::SinglePass
    } else if item_count <= config.chunked_max_items && total_cost <= config.chunked_max_cost {
        ReviewStrategy::Chunked
    } else {
        ReviewStrategy::Hierarchical
    }
}

/// One unit of review work, used for strategy selection and fan-out sizing
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Stable identifier, normally the changed path
    pub id: String,
    /// Line-count cost estimate, already clamped per item
    pub cost_estimate: u32,
    /// The analysis unit covering this item
    pub payload: AnalysisUnit,
}

impl WorkItem {
    /// Create a work item
    pub fn new(id: impl Into<String>, cost_estimate: u32, payload: AnalysisUnit) -> Self {
        Self {
            id: id.into(),
            cost_estimate,
            payload,
        }
    }
}

/// Everything one guarded analysis call needs; cheap to clone into tasks
#[derive(Clone)]
struct CallContext {
    service: Arc<dyn AnalysisService>,
    cache: Arc<ResponseCache>,
    registry: Arc<BreakerRegistry>,
    breaker_config: BreakerConfig,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl CallContext {
    /// Cache lookup, then a breaker-wrapped retrying call with a hard
    /// timeout, then cache write-back.
    ///
    /// The concurrency permit is held only around the external call and is
    /// released on every exit path by its guard.
    async fn call(&self, unit: &AnalysisUnit) -> Result<AnalysisResponse> {
        let scope = format!("{}::{}", unit.subject, unit.scope());
        let key = cache_key(&scope, &unit.content());

        if let Some(hit) = self.cache.get(&unit.subject, &key).await {
            debug!(scope = %scope, "analysis served from cache");
            return Ok(hit);
        }

        let response = {
            let _permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Other("concurrency gate closed".to_string()))?;

            let breaker = self
                .registry
                .breaker(self.service.name(), &self.breaker_config)
                .await;

            breaker
                .call(|| async {
                    retry(&self.retry, || async {
                        match tokio::time::timeout(self.call_timeout, self.service.analyze(unit))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(Error::transient("analysis call timed out")),
                        }
                    })
                    .await
                })
                .await?
        };

        self.cache
            .put(&unit.subject, &key, unit.path.as_deref(), &response)
            .await;
        Ok(response)
    }
}

/// Outcome of one fan-out call, keyed back to its unit
struct CallOutcome {
    unit: AnalysisUnit,
    /// Items this call covered (1 for per-item calls, more for groups)
    covered: usize,
    result: Result<AnalysisResponse>,
}

/// Fans review work out to the analysis service and aggregates the results
pub struct ReviewDispatcher {
    ctx: CallContext,
    config: DispatchConfig,
}

impl ReviewDispatcher {
    /// Create a dispatcher sharing the engine's cache, breaker registry,
    /// and concurrency gate
    pub fn new(
        service: Arc<dyn AnalysisService>,
        cache: Arc<ResponseCache>,
        registry: Arc<BreakerRegistry>,
        semaphore: Arc<Semaphore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ctx: CallContext {
                service,
                cache,
                registry,
                breaker_config: config.breaker.clone(),
                semaphore,
                retry: config.retry.clone(),
                call_timeout: config.call_timeout,
            },
            config: config.dispatch.clone(),
        }
    }

    /// Dispatch a batch of work items and aggregate the outcome.
    ///
    /// Never fails: item failures become counted placeholders and the
    /// aggregate is best-effort.
    pub async fn dispatch(&self, subject: &str, items: Vec<WorkItem>) -> AggregateResult {
        if items.is_empty() {
            debug!(subject, "no work items, trivially approved");
            return AggregateResult::empty_approved();
        }

        let total_cost: u32 = items.iter().map(|i| i.cost_estimate).fold(0, u32::saturating_add);
        let strategy = select_strategy(&self.config, items.len(), total_cost);
        info!(
            subject,
            %strategy,
            items = items.len(),
            total_cost,
            "dispatching review"
        );

        match strategy {
            ReviewStrategy::SinglePass => self.single_pass(subject, items).await,
            ReviewStrategy::Chunked => self.chunked(subject, items).await,
            ReviewStrategy::Hierarchical => self.hierarchical(subject, items).await,
        }
    }

    async fn single_pass(&self, subject: &str, items: Vec<WorkItem>) -> AggregateResult {
        let item_count = items.len();
        let hunks: Vec<ChangedHunk> = items
            .into_iter()
            .flat_map(|i| i.payload.hunks)
            .collect();
        let unit = AnalysisUnit::batch(subject, hunks);

        match self.ctx.call(&unit).await {
            Ok(response) => AggregateResult::from_responses(&[response], item_count, 0),
            Err(err) => {
                warn!(subject, error = %err, "single-pass analysis failed");
                let placeholder = placeholder_response("batch", &err);
                AggregateResult::from_responses(&[placeholder], item_count, item_count)
            }
        }
    }

    async fn chunked(&self, subject: &str, items: Vec<WorkItem>) -> AggregateResult {
        let item_count = items.len();

        let mut groups: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();
        for item in items {
            groups.entry(item_category(&item.id)).or_default().push(item);
        }
        debug!(subject, groups = groups.len(), "chunked into categories");

        let mut tasks: JoinSet<CallOutcome> = JoinSet::new();
        for (category, group) in groups {
            let covered = group.len();
            debug!(subject, category = %category, files = covered, "dispatching group");
            let hunks: Vec<ChangedHunk> =
                group.into_iter().flat_map(|i| i.payload.hunks).collect();
            let unit = AnalysisUnit::batch(subject, hunks);
            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let result = ctx.call(&unit).await;
                CallOutcome {
                    unit,
                    covered,
                    result,
                }
            });
        }

        let outcomes = drain(tasks).await;
        self.collect(subject, outcomes, item_count)
    }

    async fn hierarchical(&self, subject: &str, items: Vec<WorkItem>) -> AggregateResult {
        let item_count = items.len();

        // Phase 1: per-item analysis under the shared gate.
        let mut tasks: JoinSet<CallOutcome> = JoinSet::new();
        for item in items {
            let ctx = self.ctx.clone();
            let unit = item.payload;
            tasks.spawn(async move {
                let result = ctx.call(&unit).await;
                CallOutcome {
                    unit,
                    covered: 1,
                    result,
                }
            });
        }
        let outcomes = drain(tasks).await;

        // Phase 2: one cross-item correlation call over the items whose
        // individual result crossed the blocking-severity line.
        let severe_hunks: Vec<ChangedHunk> = outcomes
            .iter()
            .filter(|o| {
                o.result
                    .as_ref()
                    .map(|r| r.findings.iter().any(|f| f.severity.is_blocking()))
                    .unwrap_or(false)
            })
            .flat_map(|o| o.unit.hunks.clone())
            .collect();

        let mut aggregate = self.collect(subject, outcomes, item_count);

        if severe_hunks.is_empty() {
            debug!(subject, "no blocking findings, correlation skipped");
            return aggregate;
        }

        let correlation = AnalysisUnit::correlation(subject, severe_hunks);
        match self.ctx.call(&correlation).await {
            Ok(response) => {
                let merged = AggregateResult::from_responses(&[response], 0, 0);
                aggregate = merge_aggregates(aggregate, merged);
            }
            Err(err) => {
                warn!(subject, error = %err, "correlation analysis failed, keeping per-item results");
            }
        }

        aggregate
    }

    /// Turn call outcomes into an aggregate, converting failures into
    /// counted placeholders
    fn collect(
        &self,
        subject: &str,
        outcomes: Vec<CallOutcome>,
        item_count: usize,
    ) -> AggregateResult {
        let mut responses = Vec::with_capacity(outcomes.len());
        let mut failed = 0;
        for outcome in outcomes {
            match outcome.result {
                Ok(response) => responses.push(response),
                Err(err) => {
                    warn!(
                        subject,
                        scope = %outcome.unit.scope(),
                        error = %err,
                        "analysis failed, recording placeholder"
                    );
                    failed += outcome.covered;
                    responses.push(placeholder_response(&outcome.unit.scope(), &err));
                }
            }
        }
        AggregateResult::from_responses(&responses, item_count, failed)
    }
}

impl std::fmt::Debug for ReviewDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Await all tasks; panicked tasks are logged and skipped
async fn drain(mut tasks: JoinSet<CallOutcome>) -> Vec<CallOutcome> {
    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(error = %err, "analysis task aborted"),
        }
    }
    outcomes
}

/// Neutral placeholder for a failed call: no findings, so it cannot sway
/// the recommendation, but the failure stays visible in the summary
fn placeholder_response(scope: &str, err: &Error) -> AnalysisResponse {
    AnalysisResponse {
        summary: format!("analysis unavailable for {}: {}", scope, err),
        ..Default::default()
    }
}

/// Coarse file category used for chunked grouping
fn item_category(path: &str) -> String {
    let lower = path.to_lowercase();
    if lower.contains("test") || lower.starts_with("tests/") {
        return "tests".to_string();
    }
    match lower.rsplit('.').next() {
        Some("rs") | Some("go") | Some("py") | Some("ts") | Some("js") | Some("java") => {
            "source".to_string()
        }
        Some("md") | Some("txt") | Some("rst") => "docs".to_string(),
        Some("toml") | Some("yaml") | Some("yml") | Some("json") | Some("lock") => {
            "config".to_string()
        }
        _ => "other".to_string(),
    }
}

/// Merge two aggregates (used to fold the correlation pass in)
fn merge_aggregates(a: AggregateResult, b: AggregateResult) -> AggregateResult {
    let responses = [
        AnalysisResponse {
            findings: a.findings,
            usage: crate::analysis::Usage {
                cost: a.cost,
                tokens: a.tokens,
            },
            ..Default::default()
        },
        AnalysisResponse {
            findings: b.findings,
            usage: crate::analysis::Usage {
                cost: b.cost,
                tokens: b.tokens,
            },
            ..Default::default()
        },
    ];
    AggregateResult::from_responses(
        &responses,
        a.item_count + b.item_count,
        a.failed_item_count + b.failed_item_count,
    )
}
