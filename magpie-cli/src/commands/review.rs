//! Review command - run a review against a pull request

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use magpie_core::{EngineConfig, ReviewEngine, ReviewOutcome, ReviewRequest, TriggerKind};
use magpie_db::{Database, DatabaseConfig};
use magpie_github::{GitHubClient, GitHubProvider};

use crate::heuristic::HeuristicAnalysis;

/// Run a review against a pull request
#[derive(Args, Debug)]
pub struct ReviewArgs {
    /// Repository (owner/repo or GitHub URL)
    #[arg(long)]
    repo: String,

    /// Pull request number
    #[arg(long)]
    pr: u64,

    /// Source revision to review; defaults to the PR head
    #[arg(long)]
    revision: Option<String>,

    /// Treat a partially failed batch as a command failure
    #[arg(long)]
    strict: bool,

    /// Database file; defaults to ~/.cache/magpie/magpie.db
    #[arg(long)]
    db: Option<PathBuf>,
}

impl ReviewArgs {
    /// Execute the review command
    pub async fn execute(&self, verbose: bool, config: &EngineConfig) -> anyhow::Result<()> {
        let client = GitHubClient::from_repo_ref(&self.repo)?;
        let subject = format!("{}/{}#{}", client.owner(), client.repo(), self.pr);

        let revision = match &self.revision {
            Some(revision) => revision.clone(),
            None => client.pr_head_sha(self.pr).await?,
        };

        let db_config = match &self.db {
            Some(path) => DatabaseConfig::new(path),
            None => DatabaseConfig::default(),
        };
        let db = Database::connect(db_config).await?;
        db.migrate().await?;

        let engine = ReviewEngine::new(
            config.clone(),
            Arc::new(GitHubProvider::new(client)),
            Arc::new(HeuristicAnalysis::new()),
            Arc::new(db.store()),
        );

        let request = ReviewRequest::new(&subject, &revision, TriggerKind::Manual);
        let outcome = engine.review(&request).await?;

        match outcome {
            ReviewOutcome::Duplicate { outcome_summary } => {
                println!("Duplicate request for {}", subject);
                match outcome_summary {
                    Some(summary) => println!("  Previous outcome: {}", summary),
                    None => println!("  Previous outcome not recorded"),
                }
            }
            ReviewOutcome::Completed(aggregate) => {
                println!("Review of {} at {}", subject, revision);
                println!();
                println!("Recommendation: {}", aggregate.recommendation);
                println!(
                    "Items: {} ({} failed)",
                    aggregate.item_count, aggregate.failed_item_count
                );
                println!("Tokens: {}", aggregate.tokens);

                if aggregate.findings.is_empty() {
                    println!();
                    println!("No findings.");
                } else {
                    println!();
                    println!("Findings:");
                    for finding in &aggregate.findings {
                        println!(
                            "  {}:{} [{}/{}] {}",
                            finding.file,
                            finding.line,
                            finding.category,
                            finding.severity,
                            finding.message
                        );
                    }
                }

                if verbose {
                    println!();
                    println!("Breakers:");
                    for snapshot in engine.breaker_snapshots().await {
                        println!(
                            "  {} [{}] failures={}",
                            snapshot.service_name, snapshot.state, snapshot.failure_count
                        );
                    }
                }

                if self.strict {
                    if let Some(err) = aggregate.partial_failure() {
                        anyhow::bail!(err);
                    }
                }
            }
        }

        Ok(())
    }
}
