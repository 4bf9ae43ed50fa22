//! Partial-failure-tolerant result aggregation
//!
//! Merging is associative and commutative: findings form a set deduplicated
//! by (file, line, category) and sorted, the recommendation is derived from
//! the merged findings, and the accumulators are clamped sums. The result
//! therefore does not depend on fan-out completion order.

use std::collections::HashSet;

use serde::Serialize;
use tracing::warn;

use crate::analysis::{AnalysisResponse, Finding, Recommendation};
use crate::Error;

/// Ceiling for the aggregated cost accumulator
pub const MAX_TOTAL_COST: f64 = 1_000.0;

/// Ceiling for the aggregated token accumulator
pub const MAX_TOTAL_TOKENS: u64 = 10_000_000;

/// Merged outcome of one dispatch
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    /// Union of findings, deduplicated by (file, line, category)
    pub findings: Vec<Finding>,
    /// Derived from the merged findings, not the per-call recommendations
    pub recommendation: Recommendation,
    /// Total cost, clamped to [`MAX_TOTAL_COST`]
    pub cost: f64,
    /// Total tokens, clamped to [`MAX_TOTAL_TOKENS`]
    pub tokens: u64,
    /// Work items covered by this dispatch
    pub item_count: usize,
    /// Items whose analysis failed and became placeholders
    pub failed_item_count: usize,
}

impl AggregateResult {
    /// Trivially approved result for an empty change set
    pub fn empty_approved() -> Self {
        Self {
            findings: Vec::new(),
            recommendation: Recommendation::Approve,
            cost: 0.0,
            tokens: 0,
            item_count: 0,
            failed_item_count: 0,
        }
    }

    /// Merge responses (placeholders included) into one result
    pub fn from_responses(
        responses: &[AnalysisResponse],
        item_count: usize,
        failed_item_count: usize,
    ) -> Self {
        let mut seen: HashSet<(String, u32, String)> = HashSet::new();
        let mut findings: Vec<Finding> = Vec::new();
        let mut cost = 0.0;
        let mut tokens: u64 = 0;

        for response in responses {
            cost += response.usage.cost;
            tokens = tokens.saturating_add(response.usage.tokens);
            for finding in &response.findings {
                if seen.insert(finding.dedup_key()) {
                    findings.push(finding.clone());
                }
            }
        }

        if cost > MAX_TOTAL_COST {
            warn!(cost, max = MAX_TOTAL_COST, "aggregate cost clamped");
            cost = MAX_TOTAL_COST;
        }
        if tokens > MAX_TOTAL_TOKENS {
            warn!(tokens, max = MAX_TOTAL_TOKENS, "aggregate tokens clamped");
            tokens = MAX_TOTAL_TOKENS;
        }

        findings.sort_by(|a, b| a.dedup_key().cmp(&b.dedup_key()));
        let recommendation = recommend(&findings);

        Self {
            findings,
            recommendation,
            cost,
            tokens,
            item_count,
            failed_item_count,
        }
    }

    /// Fold failures that happened before dispatch (e.g. unfetchable diffs)
    /// into the totals
    pub fn absorb_failed_items(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.failed_item_count += count;
        self.item_count += count;
    }

    /// The partial-failure error kind, for callers that treat an incomplete
    /// aggregate as a failure
    pub fn partial_failure(&self) -> Option<Error> {
        if self.failed_item_count > 0 {
            Some(Error::PartialBatch {
                failed_items: self.failed_item_count,
                total_items: self.item_count,
            })
        } else {
            None
        }
    }

    /// One-line outcome summary recorded in the deduplication ledger
    pub fn summary(&self) -> String {
        if self.failed_item_count > 0 {
            format!(
                "{}: {} findings, {}/{} items failed",
                self.recommendation,
                self.findings.len(),
                self.failed_item_count,
                self.item_count
            )
        } else {
            format!("{}: {} findings", self.recommendation, self.findings.len())
        }
    }
}

/// Recommendation lattice: any blocking finding requests changes, any
/// finding at all comments, otherwise approve
fn recommend(findings: &[Finding]) -> Recommendation {
    if findings.iter().any(|f| f.severity.is_blocking()) {
        Recommendation::RequestChanges
    } else if findings.is_empty() {
        Recommendation::Approve
    } else {
        Recommendation::Comment
    }
}
