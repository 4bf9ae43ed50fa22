//! Magpie CLI - Command line interface for the review engine
//!
//! Runs reviews against pull requests and exposes the engine's breaker and
//! cache introspection.

mod commands;
mod heuristic;

use clap::{Parser, Subcommand};
use magpie_core::EngineConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{BreakerArgs, CacheArgs, ReviewArgs};

/// Magpie: reliability-first automated change review
#[derive(Parser, Debug)]
#[command(name = "magpie")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Concurrency gate size (overrides config and env)
    #[arg(long, global = true, env = "MAGPIE_MAX_CONCURRENT_REVIEWS")]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Run a review against a pull request
    #[command(visible_alias = "r")]
    Review(ReviewArgs),

    /// Inspect or reset circuit breakers
    Breaker(BreakerArgs),

    /// Inspect or maintain the response cache
    Cache(CacheArgs),

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    // Load configuration with overrides
    let config = EngineConfig::load_with_overrides(cli.max_concurrent)?;

    if cli.verbose {
        tracing::info!(
            max_concurrent_reviews = config.max_concurrent_reviews,
            "Configuration loaded"
        );
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("magpie {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Review(args)) => {
            args.execute(cli.verbose, &config).await?;
        }
        Some(Commands::Breaker(args)) => {
            args.execute().await?;
        }
        Some(Commands::Cache(args)) => {
            args.execute().await?;
        }
        Some(Commands::Config) => {
            println!("Magpie Configuration");
            println!("====================");
            println!();
            println!("Engine:");
            println!("  max_concurrent_reviews: {}", config.max_concurrent_reviews);
            println!("  call_timeout: {:?}", config.call_timeout);
            println!();
            println!("Breaker:");
            println!("  failure_threshold: {}", config.breaker.failure_threshold);
            println!("  success_threshold: {}", config.breaker.success_threshold);
            println!("  timeout: {:?}", config.breaker.timeout);
            println!();
            println!("Cache:");
            println!("  ttl: {:?}", config.cache.ttl);
            println!(
                "  max_writes_per_minute: {}",
                config.cache.max_writes_per_minute
            );
            println!();
            println!("Dedup retention days: {}", config.dedup.retention_days);
            if let Some(path) = EngineConfig::default_config_path() {
                println!();
                println!("Config file: {}", path.display());
                if path.exists() {
                    println!("  (exists)");
                } else {
                    println!("  (not found - using defaults)");
                }
            }
        }
        None => {
            println!("Magpie - reliability-first automated change review");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}
