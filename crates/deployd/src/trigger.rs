//! Build trigger.
//!
//! Submits the deploy job with its parameters and turns the queue redirect into
//! a `QueueToken`. A build accepted without a usable `Location` yields the
//! untrackable sentinel instead of an error.

use deploy_core::request::validate_prefix;
use deploy_core::{BuildRequest, QueueToken};
use tracing::{info, warn};

use crate::ci::{CiApi, Result, DEFAULT_FRONTEND_STACK};

/// Form fields for `buildWithParameters`.
pub fn build_parameters(request: &BuildRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("PREFIX", request.prefix().to_string()),
        ("GIT_REPO", request.repository_url().to_string()),
        ("BRANCH", request.branch().to_string()),
        (
            "USE_REPO_DOCKERFILE",
            request.use_repo_dockerfile().to_string(),
        ),
        (
            "FRONTEND_STACK",
            request
                .frontend_stack()
                .unwrap_or(DEFAULT_FRONTEND_STACK)
                .to_string(),
        ),
    ];
    if let Some(credential) = request.credential() {
        params.push(("GIT_PAT", credential.to_string()));
    }
    params
}

/// Parse the queue id from the trailing path segment of a `Location` header.
pub fn queue_token_from_location(location: Option<&str>) -> QueueToken {
    let Some(location) = location.map(str::trim).filter(|l| !l.is_empty()) else {
        return QueueToken::UNTRACKABLE;
    };

    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse::<i64>().ok())
        .filter(|id| *id >= 0)
        .map_or(QueueToken::UNTRACKABLE, QueueToken)
}

/// Trigger the deploy job for a request.
pub async fn trigger_build(ci: &dyn CiApi, request: &BuildRequest) -> Result<QueueToken> {
    ci.ensure_configured()?;
    validate_prefix(request.prefix())?;

    let queue_id = ci.trigger_build(request).await?;
    if queue_id.is_trackable() {
        info!(
            prefix = request.prefix(),
            job = ci.job_name(),
            queue_id = %queue_id,
            "build queued"
        );
    } else {
        warn!(
            prefix = request.prefix(),
            job = ci.job_name(),
            "build accepted without a trackable queue location"
        );
    }
    Ok(queue_id)
}
