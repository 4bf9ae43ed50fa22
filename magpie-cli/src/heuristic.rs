//! Rule-based local analysis service
//!
//! The default analyzer the CLI runs when no remote analysis service is
//! configured: deterministic path and content heuristics over the changed
//! hunks. Path patterns flag risky areas (auth, secrets, migrations,
//! dependency manifests); added-line patterns flag common smells.

use async_trait::async_trait;
use magpie_core::analysis::{
    AnalysisResponse, AnalysisService, AnalysisUnit, Finding, Recommendation, Severity, Usage,
};
use magpie_core::Result;

/// Deterministic heuristic analyzer
#[derive(Debug, Default)]
pub struct HeuristicAnalysis;

impl HeuristicAnalysis {
    /// Create the analyzer
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnalysisService for HeuristicAnalysis {
    async fn analyze(&self, unit: &AnalysisUnit) -> Result<AnalysisResponse> {
        let mut findings = Vec::new();
        let mut lines = 0usize;

        for hunk in &unit.hunks {
            lines += hunk.line_count();

            if let Some((category, severity, message)) = path_risk(&hunk.file_path) {
                findings.push(Finding {
                    file: hunk.file_path.clone(),
                    line: hunk.new_start_line,
                    category: category.to_string(),
                    severity,
                    message: message.to_string(),
                });
            }

            for (offset, added) in hunk.added.iter().enumerate() {
                let line = hunk.new_start_line + offset as u32;
                for (category, severity, message) in line_risks(added) {
                    findings.push(Finding {
                        file: hunk.file_path.clone(),
                        line,
                        category: category.to_string(),
                        severity,
                        message: message.to_string(),
                    });
                }
            }
        }

        let recommendation = if findings.iter().any(|f| f.severity.is_blocking()) {
            Recommendation::RequestChanges
        } else if findings.is_empty() {
            Recommendation::Approve
        } else {
            Recommendation::Comment
        };

        Ok(AnalysisResponse {
            summary: format!(
                "{} heuristic findings across {} hunks",
                findings.len(),
                unit.hunks.len()
            ),
            findings,
            recommendation,
            usage: Usage {
                cost: 0.0,
                tokens: (lines * 8) as u64,
            },
        })
    }

    fn name(&self) -> &str {
        "heuristic-analysis"
    }
}

/// Risk flag for the changed path itself
fn path_risk(path: &str) -> Option<(&'static str, Severity, &'static str)> {
    let lower = path.to_lowercase();
    if lower.contains("auth") || lower.contains("permission") {
        return Some((
            "security",
            Severity::High,
            "Auth or permission-related code changed",
        ));
    }
    if lower.contains("secret") || lower.contains("credential") {
        return Some((
            "security",
            Severity::High,
            "Possible secrets or credentials area changed",
        ));
    }
    if lower.contains("migration") || lower.contains("schema") {
        return Some((
            "data",
            Severity::Medium,
            "Schema or migration changes",
        ));
    }
    if lower.ends_with(".lock")
        || lower.ends_with("package.json")
        || lower.ends_with("cargo.toml")
        || lower.ends_with("go.mod")
    {
        return Some((
            "dependencies",
            Severity::Low,
            "Dependency manifest or lockfile changed",
        ));
    }
    None
}

/// Risk flags for one added line
fn line_risks(line: &str) -> Vec<(&'static str, Severity, &'static str)> {
    let mut risks = Vec::new();
    let lower = line.to_lowercase();

    if line.contains(".unwrap()") || line.contains(".expect(") {
        risks.push((
            "correctness",
            Severity::Medium,
            "Added unwrap/expect can panic at runtime",
        ));
    }
    if line.contains("panic!(") {
        risks.push(("correctness", Severity::High, "Added explicit panic"));
    }
    if lower.contains("password =") || lower.contains("api_key =") || lower.contains("token = \"")
    {
        risks.push((
            "security",
            Severity::Critical,
            "Possible hardcoded credential",
        ));
    }
    if line.contains("TODO") || line.contains("FIXME") {
        risks.push((
            "maintainability",
            Severity::Low,
            "Unresolved TODO/FIXME marker added",
        ));
    }
    if line.contains("dbg!(") {
        risks.push(("style", Severity::Low, "Leftover debug macro"));
    }

    risks
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_core::ChangedHunk;

    fn unit(path: &str, added: Vec<&str>) -> AnalysisUnit {
        AnalysisUnit::item(
            "o/r#1",
            path,
            vec![ChangedHunk {
                file_path: path.to_string(),
                old_start_line: 10,
                new_start_line: 10,
                context_before: vec![],
                removed: vec![],
                added: added.into_iter().map(String::from).collect(),
                context_after: vec![],
            }],
        )
    }

    #[tokio::test]
    async fn test_clean_change_approves() {
        let service = HeuristicAnalysis::new();
        let response = service
            .analyze(&unit("src/lib.rs", vec!["let x = 1;"]))
            .await
            .unwrap();
        assert!(response.findings.is_empty());
        assert_eq!(response.recommendation, Recommendation::Approve);
    }

    #[tokio::test]
    async fn test_unwrap_flags_correctness() {
        let service = HeuristicAnalysis::new();
        let response = service
            .analyze(&unit("src/lib.rs", vec!["let v = map.get(k).unwrap();"]))
            .await
            .unwrap();
        assert_eq!(response.findings.len(), 1);
        assert_eq!(response.findings[0].category, "correctness");
        assert_eq!(response.findings[0].line, 10);
        assert_eq!(response.recommendation, Recommendation::Comment);
    }

    #[tokio::test]
    async fn test_auth_path_requests_changes() {
        let service = HeuristicAnalysis::new();
        let response = service
            .analyze(&unit("src/auth/login.rs", vec!["let ok = true;"]))
            .await
            .unwrap();
        assert_eq!(response.findings[0].severity, Severity::High);
        assert_eq!(response.recommendation, Recommendation::RequestChanges);
    }

    #[tokio::test]
    async fn test_hardcoded_credential_is_critical() {
        let service = HeuristicAnalysis::new();
        let response = service
            .analyze(&unit("src/config.rs", vec!["let api_key = \"sk-123\";"]))
            .await
            .unwrap();
        assert!(response
            .findings
            .iter()
            .any(|f| f.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn test_line_numbers_follow_added_offsets() {
        let service = HeuristicAnalysis::new();
        let response = service
            .analyze(&unit(
                "src/lib.rs",
                vec!["let a = 1;", "let b = c.unwrap();"],
            ))
            .await
            .unwrap();
        assert_eq!(response.findings[0].line, 11);
    }
}
