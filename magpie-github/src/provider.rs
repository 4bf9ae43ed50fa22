//! Source change provider over GitHub pull requests
//!
//! Review subjects are `owner/repo#number`. The changed-file listing is
//! fetched once per subject and memoized, so per-path diff fetches do not
//! repeat the API call; GitHub's per-file patches are wrapped back into
//! standard unified-diff framing for the extractor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use octocrab::models::repos::DiffEntryStatus;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use magpie_core::provider::SourceChangeProvider;
use magpie_core::Error as CoreError;

use crate::{Error, GitHubClient};

/// Changed-file record kept per subject: path status plus the patch text
/// (absent for binary or oversized files)
#[derive(Debug, Clone)]
struct FileRecord {
    status: DiffEntryStatus,
    patch: Option<String>,
}

/// [`SourceChangeProvider`] implementation over one repository's PRs
pub struct GitHubProvider {
    client: GitHubClient,
    /// Per-subject changed-file memo
    files: Mutex<HashMap<String, Arc<HashMap<String, FileRecord>>>>,
}

impl GitHubProvider {
    /// Create a provider over the given client
    pub fn new(client: GitHubClient) -> Self {
        Self {
            client,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the memoized listing for a subject (e.g. after a new push)
    pub async fn forget(&self, subject: &str) {
        self.files.lock().await.remove(subject);
    }

    async fn files_for(
        &self,
        subject: &str,
    ) -> magpie_core::Result<Arc<HashMap<String, FileRecord>>> {
        {
            let memo = self.files.lock().await;
            if let Some(files) = memo.get(subject) {
                return Ok(Arc::clone(files));
            }
        }

        let (owner, repo, number) = parse_subject(subject).map_err(classify)?;
        if owner != self.client.owner() || repo != self.client.repo() {
            return Err(CoreError::Validation(format!(
                "subject {} does not belong to {}/{}",
                subject,
                self.client.owner(),
                self.client.repo()
            )));
        }

        let entries = self.client.pr_files(number).await.map_err(classify)?;
        let mut files = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.patch.is_none() {
                debug!(path = %entry.filename, "file has no textual patch, skipping");
            }
            files.insert(
                entry.filename.clone(),
                FileRecord {
                    status: entry.status,
                    patch: entry.patch,
                },
            );
        }

        let files = Arc::new(files);
        self.files
            .lock()
            .await
            .insert(subject.to_string(), Arc::clone(&files));
        Ok(files)
    }
}

#[async_trait]
impl SourceChangeProvider for GitHubProvider {
    async fn list_changed_paths(&self, subject: &str) -> magpie_core::Result<Vec<String>> {
        let files = self.files_for(subject).await?;
        let mut paths: Vec<String> = files
            .iter()
            .filter(|(_, record)| record.patch.is_some())
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn fetch_diff(&self, subject: &str, path: &str) -> magpie_core::Result<String> {
        let files = self.files_for(subject).await?;
        match files.get(path) {
            Some(record) => match &record.patch {
                Some(patch) => Ok(frame_patch(path, record.status.clone(), patch)),
                None => Ok(String::new()),
            },
            None => {
                warn!(subject, path, "requested path not in the change set");
                Err(CoreError::Validation(format!(
                    "path {} is not part of {}",
                    path, subject
                )))
            }
        }
    }

    fn name(&self) -> &str {
        "github"
    }
}

impl std::fmt::Debug for GitHubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubProvider")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// Parse `owner/repo#number` into its parts
pub fn parse_subject(subject: &str) -> crate::Result<(String, String, u64)> {
    let (repo_ref, number) = subject.split_once('#').ok_or_else(|| {
        Error::Parse(format!(
            "Invalid subject: {}. Expected owner/repo#number",
            subject
        ))
    })?;
    let number: u64 = number
        .parse()
        .map_err(|_| Error::Parse(format!("Invalid pull request number in {}", subject)))?;
    let (owner, repo) = crate::client::parse_repo_ref(repo_ref)?;
    Ok((owner, repo, number))
}

/// Wrap a bare GitHub file patch back into unified-diff framing
fn frame_patch(path: &str, status: DiffEntryStatus, patch: &str) -> String {
    let (minus, plus) = match status {
        DiffEntryStatus::Added => ("/dev/null".to_string(), format!("b/{}", path)),
        DiffEntryStatus::Removed => (format!("a/{}", path), "/dev/null".to_string()),
        _ => (format!("a/{}", path), format!("b/{}", path)),
    };
    let mut out = format!(
        "diff --git a/{path} b/{path}\n--- {minus}\n+++ {plus}\n{patch}"
    );
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Map GitHub-layer errors into the core taxonomy.
///
/// Rate limiting and transport failures are transient and retried by the
/// engine; bad subjects are validation failures.
fn classify(err: Error) -> CoreError {
    match err {
        Error::Api(octocrab::Error::GitHub { source, .. }) => {
            let message = source.message.to_lowercase();
            if message.contains("rate limit") || message.contains("abuse") {
                CoreError::Transient(format!("GitHub rate limited: {}", source.message))
            } else {
                CoreError::Other(format!("GitHub API error: {}", source.message))
            }
        }
        Error::Api(other) => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("timed out")
                || lower.contains("timeout")
                || lower.contains("connect")
                || lower.contains("connection")
            {
                CoreError::Transient(message)
            } else {
                CoreError::Other(message)
            }
        }
        Error::PrNotFound(number) => {
            CoreError::Validation(format!("pull request #{} not found", number))
        }
        Error::Parse(message) => CoreError::Validation(message),
        Error::Auth(message) => CoreError::Other(message),
        Error::Other(message) => CoreError::Other(message),
    }
}
