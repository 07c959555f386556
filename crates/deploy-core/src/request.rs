//! Build request construction and validation.
//!
//! The prefix becomes a Kubernetes namespace and a domain label downstream, so it
//! is limited to lowercase alphanumerics and hyphens, at most 30 characters.

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Maximum prefix length accepted by the CI job.
pub const MAX_PREFIX_LENGTH: usize = 30;

/// Branch used when the caller does not name one.
pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("prefix must not be empty")]
    EmptyPrefix,
    #[error("prefix may only contain lowercase letters, digits and '-': {0}")]
    InvalidPrefixChars(String),
    #[error("prefix must be at most {MAX_PREFIX_LENGTH} characters (got {0})")]
    PrefixTooLong(usize),
    #[error("invalid repository url: {0}")]
    InvalidRepositoryUrl(String),
    #[error("branch must not be empty")]
    EmptyBranch,
}

/// Check a deploy prefix against `[a-z0-9-]{1,30}`.
pub fn validate_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.is_empty() {
        return Err(ValidationError::EmptyPrefix);
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::InvalidPrefixChars(prefix.to_string()));
    }
    let len = prefix.chars().count();
    if len > MAX_PREFIX_LENGTH {
        return Err(ValidationError::PrefixTooLong(len));
    }
    Ok(())
}

fn validate_repository_url(value: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(value)
        .map_err(|e| ValidationError::InvalidRepositoryUrl(format!("{value}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ValidationError::InvalidRepositoryUrl(value.to_string()));
    }
    Ok(url)
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

/// Unvalidated build parameters as received from a caller.
#[derive(Clone, Deserialize)]
pub struct BuildRequestInput {
    pub prefix: String,
    pub git_repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub use_repo_dockerfile: bool,
    #[serde(default)]
    pub frontend_stack: Option<String>,
    #[serde(default)]
    pub git_pat: Option<String>,
}

impl std::fmt::Debug for BuildRequestInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRequestInput")
            .field("prefix", &self.prefix)
            .field("git_repo", &self.git_repo)
            .field("branch", &self.branch)
            .field("use_repo_dockerfile", &self.use_repo_dockerfile)
            .field("frontend_stack", &self.frontend_stack)
            .field("git_pat", &self.git_pat.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl BuildRequestInput {
    pub fn validate(self) -> Result<BuildRequest, ValidationError> {
        validate_prefix(&self.prefix)?;
        let repository_url = validate_repository_url(&self.git_repo)?;
        if self.branch.trim().is_empty() {
            return Err(ValidationError::EmptyBranch);
        }

        Ok(BuildRequest {
            prefix: self.prefix,
            repository_url,
            branch: self.branch,
            use_repo_dockerfile: self.use_repo_dockerfile,
            frontend_stack: self.frontend_stack.filter(|s| !s.trim().is_empty()),
            credential: self.git_pat.filter(|s| !s.is_empty()),
        })
    }
}

/// A validated, immutable request to run the deploy job.
#[derive(Clone, PartialEq, Eq)]
pub struct BuildRequest {
    prefix: String,
    repository_url: Url,
    branch: String,
    use_repo_dockerfile: bool,
    frontend_stack: Option<String>,
    credential: Option<String>,
}

impl BuildRequest {
    /// Validate a request with default options (main branch, generated Dockerfile).
    pub fn new(prefix: &str, git_repo: &str) -> Result<Self, ValidationError> {
        BuildRequestInput {
            prefix: prefix.to_string(),
            git_repo: git_repo.to_string(),
            branch: default_branch(),
            use_repo_dockerfile: false,
            frontend_stack: None,
            git_pat: None,
        }
        .validate()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn repository_url(&self) -> &Url {
        &self.repository_url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn use_repo_dockerfile(&self) -> bool {
        self.use_repo_dockerfile
    }

    pub fn frontend_stack(&self) -> Option<&str> {
        self.frontend_stack.as_deref()
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

impl std::fmt::Debug for BuildRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRequest")
            .field("prefix", &self.prefix)
            .field("repository_url", &self.repository_url.as_str())
            .field("branch", &self.branch)
            .field("use_repo_dockerfile", &self.use_repo_dockerfile)
            .field("frontend_stack", &self.frontend_stack)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
