//! Cache command - statistics, invalidation, and retention sweep

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Subcommand};
use magpie_core::{cache::CacheConfig, ResponseCache};
use magpie_db::{Database, DatabaseConfig};

/// Inspect or maintain the response cache
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Database file; defaults to ~/.cache/magpie/magpie.db
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Show cache statistics for a review subject
    Stats {
        /// Review subject, e.g. owner/repo#42
        subject: String,
    },

    /// Delete cached responses for a subject, optionally one path
    Invalidate {
        /// Review subject, e.g. owner/repo#42
        subject: String,

        /// Narrow the invalidation to a single path
        #[arg(long)]
        path: Option<String>,
    },

    /// Delete expired entries and aged deduplication partitions
    Purge {
        /// Retention horizon in days for deduplication records
        #[arg(long, default_value_t = 7)]
        retention_days: u32,
    },
}

impl CacheArgs {
    /// Execute the cache command
    pub async fn execute(&self) -> anyhow::Result<()> {
        let db_config = match &self.db {
            Some(path) => DatabaseConfig::new(path),
            None => DatabaseConfig::default(),
        };
        let db = Database::connect(db_config).await?;
        db.migrate().await?;
        let store = db.store();

        match &self.command {
            CacheCommand::Stats { subject } => {
                let cache = ResponseCache::new(Arc::new(store), CacheConfig::default());
                let stats = cache.statistics(subject).await;

                println!("Cache statistics for {}", subject);
                println!();
                println!("  Active entries: {}", stats.active_entries);
                println!("  Expired entries: {}", stats.expired_entries);
                println!("  Hits this process: {}", stats.hits);
                println!("  Misses this process: {}", stats.misses);
                println!("  Dropped writes: {}", stats.dropped_writes);
            }
            CacheCommand::Invalidate { subject, path } => {
                let cache = ResponseCache::new(Arc::new(store), CacheConfig::default());
                let removed = cache.invalidate(subject, path.as_deref()).await;
                println!("Removed {} cached entries.", removed);
            }
            CacheCommand::Purge { retention_days } => {
                let removed = store.purge_expired(*retention_days).await?;
                println!("Removed {} expired or aged rows.", removed);
            }
        }

        Ok(())
    }
}
