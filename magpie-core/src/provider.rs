//! Source change provider interface
//!
//! The provider is an external collaborator that knows how to enumerate and
//! fetch the changes under review. Implementations map their transport
//! errors into the core taxonomy; transient failures are retried by the
//! engine before they count against anything.

use async_trait::async_trait;

use crate::Result;

/// External source of changed paths and their diffs
#[async_trait]
pub trait SourceChangeProvider: Send + Sync {
    /// List the paths changed by the review subject
    async fn list_changed_paths(&self, subject: &str) -> Result<Vec<String>>;

    /// Fetch the unified diff text for one changed path
    async fn fetch_diff(&self, subject: &str, path: &str) -> Result<String>;

    /// Dependency name used for the circuit breaker and logs
    fn name(&self) -> &str {
        "source-provider"
    }
}
