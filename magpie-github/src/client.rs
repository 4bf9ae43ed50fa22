//! GitHub API client using octocrab

use crate::{Error, Result};
use octocrab::models::repos::DiffEntry;
use octocrab::Octocrab;
use tracing::{debug, info};

/// GitHub API client scoped to one repository
pub struct GitHubClient {
    client: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubClient {
    /// Create a client for `owner/repo`.
    ///
    /// The token is read from the GITHUB_TOKEN environment variable.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let owner = owner.into();
        let repo = repo.into();

        let token = std::env::var("GITHUB_TOKEN").map_err(|_| {
            Error::Auth(
                "GitHub token not found. Set the GITHUB_TOKEN environment variable".to_string(),
            )
        })?;

        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| Error::Auth(format!("Failed to create GitHub client: {}", e)))?;

        info!(owner = %owner, repo = %repo, "Created GitHub client");

        Ok(Self {
            client,
            owner,
            repo,
        })
    }

    /// Create a client from a repository reference.
    ///
    /// Accepts `owner/repo` or an https GitHub URL.
    pub fn from_repo_ref(reference: &str) -> Result<Self> {
        let (owner, repo) = parse_repo_ref(reference)?;
        Self::new(owner, repo)
    }

    /// Get the repository owner
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Get the repository name
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Head commit SHA of a pull request
    pub async fn pr_head_sha(&self, number: u64) -> Result<String> {
        debug!(number, "Fetching pull request head");

        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .get(number)
            .await
            .map_err(|e| match &e {
                octocrab::Error::GitHub { source, .. }
                    if source.message.contains("Not Found") =>
                {
                    Error::PrNotFound(number)
                }
                _ => Error::Api(e),
            })?;

        Ok(pr.head.sha)
    }

    /// All changed files of a pull request, following pagination
    pub async fn pr_files(&self, number: u64) -> Result<Vec<DiffEntry>> {
        debug!(number, "Listing pull request files");

        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list_files(number)
            .await
            .map_err(|e| match &e {
                octocrab::Error::GitHub { source, .. }
                    if source.message.contains("Not Found") =>
                {
                    Error::PrNotFound(number)
                }
                _ => Error::Api(e),
            })?;

        let files = self.client.all_pages(page).await.map_err(Error::Api)?;
        info!(number, files = files.len(), "Fetched pull request files");
        Ok(files)
    }

    /// Test the connection by fetching repository info
    pub async fn test_connection(&self) -> Result<()> {
        debug!(owner = %self.owner, repo = %self.repo, "Testing GitHub connection");

        self.client
            .repos(&self.owner, &self.repo)
            .get()
            .await
            .map_err(|e| match &e {
                octocrab::Error::GitHub { source, .. } => {
                    if source.message.contains("Bad credentials") {
                        Error::Auth("Invalid GitHub token".to_string())
                    } else {
                        Error::Other(format!(
                            "Repository {}/{} not accessible: {}",
                            self.owner, self.repo, source.message
                        ))
                    }
                }
                _ => Error::Api(e),
            })?;

        info!("GitHub connection successful");
        Ok(())
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

/// Parse `owner/repo` or an https GitHub URL into (owner, repo)
pub fn parse_repo_ref(reference: &str) -> Result<(String, String)> {
    let path = if reference.starts_with("https://") || reference.starts_with("http://") {
        let parsed = url::Url::parse(reference).map_err(|e| Error::Parse(e.to_string()))?;
        parsed.path().trim_start_matches('/').to_string()
    } else {
        reference.to_string()
    };

    let path = path.trim_end_matches(".git");
    match path.split('/').collect::<Vec<_>>().as_slice() {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(Error::Parse(format!(
            "Invalid repository reference: {}. Expected owner/repo",
            reference
        ))),
    }
}
