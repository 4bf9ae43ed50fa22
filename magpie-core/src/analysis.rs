//! Analysis service interface and finding data model
//!
//! The analysis service is an external collaborator: it receives a unit of
//! changed code and returns findings with a recommendation. Transient
//! failures are retried by the caller before the circuit breaker sees one
//! logical failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::diff::ChangedHunk;
use crate::Result;

/// Severity of a single finding
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and Critical findings block approval and trigger correlation
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Overall recommendation for a change set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    #[default]
    Approve,
    Comment,
    RequestChanges,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::Approve => write!(f, "approve"),
            Recommendation::Comment => write!(f, "comment"),
            Recommendation::RequestChanges => write!(f, "request_changes"),
        }
    }
}

/// A single issue reported by the analysis service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// File the finding is in
    pub file: String,
    /// Line the finding anchors to (new side)
    pub line: u32,
    /// Category slug, e.g. "correctness" or "security"
    pub category: String,
    /// Severity
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
}

impl Finding {
    /// Identity used when deduplicating findings across calls
    pub fn dedup_key(&self) -> (String, u32, String) {
        (self.file.clone(), self.line, self.category.clone())
    }
}

/// Token and cost accounting for one analysis call
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Cost in abstract billing units
    pub cost: f64,
    /// Tokens consumed
    pub tokens: u64,
}

/// Response from one analysis call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResponse {
    /// Findings for the analyzed unit
    pub findings: Vec<Finding>,
    /// Service-level recommendation for the unit
    pub recommendation: Recommendation,
    /// Short free-text summary
    pub summary: String,
    /// Accounting
    pub usage: Usage,
}

/// What one analysis call covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// A single work item (one file's hunks)
    Item,
    /// Several items analyzed in one call
    Batch,
    /// Cross-item correlation over high-severity items
    Correlation,
}

/// A unit of work handed to the analysis service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisUnit {
    /// Review subject, e.g. "owner/repo#42"
    pub subject: String,
    /// Path for per-item units; None for batch/correlation units
    pub path: Option<String>,
    /// What kind of call this is
    pub kind: UnitKind,
    /// The changed hunks the call sees
    pub hunks: Vec<ChangedHunk>,
}

impl AnalysisUnit {
    /// Per-item unit for a single file
    pub fn item(subject: impl Into<String>, path: impl Into<String>, hunks: Vec<ChangedHunk>) -> Self {
        Self {
            subject: subject.into(),
            path: Some(path.into()),
            kind: UnitKind::Item,
            hunks,
        }
    }

    /// Batch unit covering several files at once
    pub fn batch(subject: impl Into<String>, hunks: Vec<ChangedHunk>) -> Self {
        Self {
            subject: subject.into(),
            path: None,
            kind: UnitKind::Batch,
            hunks,
        }
    }

    /// Correlation unit over the hunks of high-severity items
    pub fn correlation(subject: impl Into<String>, hunks: Vec<ChangedHunk>) -> Self {
        Self {
            subject: subject.into(),
            path: None,
            kind: UnitKind::Correlation,
            hunks,
        }
    }

    /// Canonical content used for cache keying.
    ///
    /// Includes the hunk text and positions but not the subject, so the
    /// same change content reuses a cached response across re-deliveries.
    pub fn content(&self) -> String {
        let mut out = String::new();
        for hunk in &self.hunks {
            out.push_str(&format!(
                "{}@{}:{}\n",
                hunk.file_path, hunk.old_start_line, hunk.new_start_line
            ));
            for line in &hunk.removed {
                out.push('-');
                out.push_str(line);
                out.push('\n');
            }
            for line in &hunk.added {
                out.push('+');
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// Label used in cache keys and logs to disambiguate call scope
    pub fn scope(&self) -> String {
        match (&self.kind, &self.path) {
            (UnitKind::Item, Some(path)) => path.clone(),
            (UnitKind::Item, None) => "item".to_string(),
            (UnitKind::Batch, _) => "batch".to_string(),
            (UnitKind::Correlation, _) => "correlation".to_string(),
        }
    }
}

/// External analysis service
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Analyze one unit of changed code
    async fn analyze(&self, unit: &AnalysisUnit) -> Result<AnalysisResponse>;

    /// Dependency name used for the circuit breaker and logs
    fn name(&self) -> &str {
        "analysis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hunk(path: &str) -> ChangedHunk {
        ChangedHunk {
            file_path: path.to_string(),
            old_start_line: 1,
            new_start_line: 1,
            context_before: vec![],
            removed: vec!["old".to_string()],
            added: vec!["new".to_string()],
            context_after: vec![],
        }
    }

    #[test]
    fn test_severity_blocking() {
        assert!(Severity::Critical.is_blocking());
        assert!(Severity::High.is_blocking());
        assert!(!Severity::Medium.is_blocking());
        assert!(!Severity::Info.is_blocking());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_unit_content_is_deterministic() {
        let a = AnalysisUnit::item("o/r#1", "src/a.rs", vec![hunk("src/a.rs")]);
        let b = AnalysisUnit::item("o/r#1", "src/a.rs", vec![hunk("src/a.rs")]);
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn test_unit_content_reflects_changes() {
        let a = AnalysisUnit::item("o/r#1", "src/a.rs", vec![hunk("src/a.rs")]);
        let mut changed = hunk("src/a.rs");
        changed.added.push("extra".to_string());
        let b = AnalysisUnit::item("o/r#1", "src/a.rs", vec![changed]);
        assert_ne!(a.content(), b.content());
    }

    #[test]
    fn test_finding_dedup_key() {
        let finding = Finding {
            file: "src/a.rs".to_string(),
            line: 10,
            category: "correctness".to_string(),
            severity: Severity::High,
            message: "suspicious unwrap".to_string(),
        };
        assert_eq!(
            finding.dedup_key(),
            ("src/a.rs".to_string(), 10, "correctness".to_string())
        );
    }
}
