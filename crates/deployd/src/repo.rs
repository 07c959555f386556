//! Repository metadata lookup for the auto-deploy path.
//!
//! When a deploy request carries no commit information, the daemon records the
//! head of the requested branch as reported by the repository host.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Length of the abbreviated commit id stored on deploy records.
pub const SHORT_SHA_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("cannot derive owner/repository from {0}")]
    InvalidRepository(String),
    #[error("repository host returned HTTP {status}")]
    Upstream { status: u16 },
    #[error("branch {0} has no commits")]
    NoCommits(String),
    #[error("repository request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Head commit of a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub short_id: String,
    pub message: String,
}

#[async_trait]
pub trait RepoMetadata: Send + Sync {
    async fn latest_commit(&self, repository: &Url, branch: &str) -> Result<CommitInfo, RepoError>;
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
    commit: CommitBody,
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    message: String,
}

/// Owner and repository name from the last two path segments.
pub fn owner_and_repo(repository: &Url) -> Result<(String, String), RepoError> {
    let invalid = || RepoError::InvalidRepository(repository.to_string());
    let mut segments: Vec<&str> = repository
        .path_segments()
        .ok_or_else(invalid)?
        .filter(|s| !s.is_empty())
        .collect();

    let repo = segments.pop().ok_or_else(invalid)?;
    let owner = segments.pop().ok_or_else(invalid)?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return Err(invalid());
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Upper bound on one commit lookup; it runs inside `POST /deploys`.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// GitHub REST API client for public repositories.
#[derive(Debug, Clone)]
pub struct GitHubMetadata {
    api_base: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl GitHubMetadata {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RepoMetadata for GitHubMetadata {
    async fn latest_commit(&self, repository: &Url, branch: &str) -> Result<CommitInfo, RepoError> {
        let (owner, repo) = owner_and_repo(repository)?;
        let url = format!("{}/repos/{owner}/{repo}/commits", self.api_base);

        let response = self
            .http
            .get(&url)
            .query(&[("sha", branch), ("per_page", "1")])
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, concat!("deployd/", env!("CARGO_PKG_VERSION")))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RepoError::Upstream {
                status: response.status().as_u16(),
            });
        }

        let commits: Vec<CommitEntry> = response.json().await?;
        let latest = commits
            .into_iter()
            .next()
            .ok_or_else(|| RepoError::NoCommits(branch.to_string()))?;

        let short_id: String = latest.sha.chars().take(SHORT_SHA_LEN).collect();
        debug!(owner = %owner, repo = %repo, branch, commit = %short_id, "resolved branch head");
        Ok(CommitInfo {
            short_id,
            message: latest.commit.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn owner_and_repo_from_plain_url() {
        let (owner, repo) = owner_and_repo(&url("https://github.com/acme/shop")).unwrap();
        assert_eq!((owner.as_str(), repo.as_str()), ("acme", "shop"));
    }

    #[test]
    fn owner_and_repo_strips_git_suffix_and_slash() {
        let (owner, repo) = owner_and_repo(&url("https://github.com/acme/shop.git/")).unwrap();
        assert_eq!((owner.as_str(), repo.as_str()), ("acme", "shop"));
    }

    #[test]
    fn owner_and_repo_needs_two_segments() {
        assert!(matches!(
            owner_and_repo(&url("https://github.com/acme")),
            Err(RepoError::InvalidRepository(_))
        ));
    }

    #[tokio::test]
    async fn latest_commit_is_abbreviated() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/shop/commits")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("sha".into(), "develop".into()),
                Matcher::UrlEncoded("per_page".into(), "1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"sha":"0123456789abcdef","commit":{"message":"Fix checkout"}}]"#)
            .create_async()
            .await;

        let github = GitHubMetadata::new(server.url());
        let commit = github
            .latest_commit(&url("https://github.com/acme/shop"), "develop")
            .await
            .unwrap();

        assert_eq!(commit.short_id, "012345");
        assert_eq!(commit.message, "Fix checkout");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_repository_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/gone/commits")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let github = GitHubMetadata::new(server.url());
        let err = github
            .latest_commit(&url("https://github.com/acme/gone"), "main")
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Upstream { status: 404 }));
    }

    #[tokio::test]
    async fn empty_branch_history_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/shop/commits")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let github = GitHubMetadata::new(server.url());
        let err = github
            .latest_commit(&url("https://github.com/acme/shop"), "main")
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::NoCommits(_)));
    }

    #[tokio::test]
    async fn unresponsive_host_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let github = GitHubMetadata::new(format!("http://{addr}"))
            .with_timeout(Duration::from_millis(200));
        let err = github
            .latest_commit(&url("https://github.com/acme/shop"), "main")
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Transport(ref e) if e.is_timeout()));
    }
}
