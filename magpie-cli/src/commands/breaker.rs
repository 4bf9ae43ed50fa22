//! Breaker command - inspect and reset circuit breakers

use clap::{Args, Subcommand};
use magpie_core::BreakerRegistry;

/// Inspect or reset circuit breakers
#[derive(Args, Debug)]
pub struct BreakerArgs {
    #[command(subcommand)]
    command: BreakerCommand,
}

#[derive(Subcommand, Debug)]
enum BreakerCommand {
    /// Show the state of every breaker in this process
    Status,

    /// Reset a breaker to the closed state
    Reset {
        /// Service name, e.g. "heuristic-analysis" or "github"
        service: String,
    },
}

impl BreakerArgs {
    /// Execute the breaker command
    pub async fn execute(&self) -> anyhow::Result<()> {
        let registry = BreakerRegistry::global();

        match &self.command {
            BreakerCommand::Status => {
                let snapshots = registry.snapshots().await;
                if snapshots.is_empty() {
                    println!("No breakers registered in this process.");
                    return Ok(());
                }

                println!("Circuit breakers:");
                println!();
                for snapshot in snapshots {
                    println!("  {} [{}]", snapshot.service_name, snapshot.state);
                    println!("      Failures: {}", snapshot.failure_count);
                    println!("      Successes: {}", snapshot.success_count);
                    if let Some(secs) = snapshot.seconds_since_last_failure {
                        println!("      Last failure: {:.1}s ago", secs);
                    }
                    if let Some(secs) = snapshot.seconds_until_retry {
                        println!("      Next probe in: {:.1}s", secs);
                    }
                }
            }
            BreakerCommand::Reset { service } => {
                if registry.reset(service).await? {
                    println!("Breaker '{}' reset to closed.", service);
                } else {
                    println!("No breaker registered for '{}'.", service);
                }
            }
        }

        Ok(())
    }
}
