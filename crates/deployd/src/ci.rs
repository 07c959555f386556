//! CI system client.
//!
//! `CiApi` is the seam between the deploy pipeline and the build server. The
//! production implementation talks to a Jenkins-shaped HTTP API with basic auth:
//!
//! - `POST /job/{job}/buildWithParameters` -> 201/202 + `Location: .../queue/item/{id}/`
//! - `GET /queue/item/{id}/api/json` -> `{"executable": {"number": N}}` once scheduled
//! - `GET /job/{job}/{n}/api/json` -> `{"result": "SUCCESS" | null, ...}`
//! - `GET /job/{job}/{n}/logText/progressiveText?start={offset}`

use std::time::Duration;

use async_trait::async_trait;
use deploy_core::config::{CiCredentials, ConfigError};
use deploy_core::{
    BuildInstance, BuildRequest, Config, FailureKind, LogChunk, QueueToken, RemoteOutcome,
    ValidationError,
};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::logs;
use crate::trigger;

/// Frontend stack sent when the request does not name one.
pub const DEFAULT_FRONTEND_STACK: &str = "react-vite";

const HEADER_TEXT_SIZE: &str = "X-Text-Size";
const HEADER_MORE_DATA: &str = "X-More-Data";

#[derive(Debug, Error)]
pub enum CiError {
    #[error("CI is not configured: {0}")]
    Configuration(String),
    #[error("invalid build request: {0}")]
    Validation(#[from] ValidationError),
    #[error("CI returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("CI request failed: {0}")]
    Transport(String),
    #[error("invalid CI response: {0}")]
    InvalidResponse(String),
    #[error("queue item {queue_id} was not scheduled within {}s", .waited.as_secs())]
    ResolutionTimeout { queue_id: QueueToken, waited: Duration },
    #[error("build {build} did not finish within {}s", .waited.as_secs())]
    PollTimeout {
        build: BuildInstance,
        waited: Duration,
    },
    #[error("CI accepted the build without a trackable queue location")]
    Untrackable,
}

impl CiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Validation(_) => FailureKind::Validation,
            Self::Upstream { .. } => FailureKind::Upstream,
            Self::Transport(_) => FailureKind::Transport,
            Self::InvalidResponse(_) => FailureKind::InvalidResponse,
            Self::ResolutionTimeout { .. } => FailureKind::ResolutionTimeout,
            Self::PollTimeout { .. } => FailureKind::PollTimeout,
            Self::Untrackable => FailureKind::Untrackable,
        }
    }

    /// Errors that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Validation(_))
    }
}

impl From<ConfigError> for CiError {
    fn from(e: ConfigError) -> Self {
        CiError::Configuration(e.to_string())
    }
}

impl From<reqwest::Error> for CiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CiError::InvalidResponse(e.to_string())
        } else {
            CiError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CiError>;

/// Operations the deploy pipeline needs from the CI system.
///
/// Each method is exactly one upstream request.
#[async_trait]
pub trait CiApi: Send + Sync {
    /// Name of the job builds are triggered on.
    fn job_name(&self) -> &str;

    /// Fail fast when the client cannot reach a configured CI endpoint.
    fn ensure_configured(&self) -> Result<()> {
        Ok(())
    }

    /// Submit a parameterized build; returns the queue placement.
    async fn trigger_build(&self, request: &BuildRequest) -> Result<QueueToken>;

    /// Build number assigned to a queue item, if scheduled yet.
    async fn queue_item(&self, queue_id: QueueToken) -> Result<Option<u64>>;

    /// Result of a build, or `None` while it is still running.
    async fn build_result(&self, build: &BuildInstance) -> Result<Option<RemoteOutcome>>;

    /// One progressive read of a build's console log from `offset`.
    async fn progressive_log(&self, build: &BuildInstance, offset: u64) -> Result<LogChunk>;
}

/// Stand-in used when CI settings are missing; every call is a configuration error.
#[derive(Debug, Clone)]
pub struct UnconfiguredCi {
    job_name: String,
    reason: String,
}

impl UnconfiguredCi {
    pub fn new(job_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            reason: reason.into(),
        }
    }

    fn error(&self) -> CiError {
        CiError::Configuration(self.reason.clone())
    }
}

#[async_trait]
impl CiApi for UnconfiguredCi {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn ensure_configured(&self) -> Result<()> {
        Err(self.error())
    }

    async fn trigger_build(&self, _request: &BuildRequest) -> Result<QueueToken> {
        Err(self.error())
    }

    async fn queue_item(&self, _queue_id: QueueToken) -> Result<Option<u64>> {
        Err(self.error())
    }

    async fn build_result(&self, _build: &BuildInstance) -> Result<Option<RemoteOutcome>> {
        Err(self.error())
    }

    async fn progressive_log(&self, _build: &BuildInstance, _offset: u64) -> Result<LogChunk> {
        Err(self.error())
    }
}

#[derive(Debug, Deserialize)]
struct QueueItemResponse {
    #[serde(default)]
    executable: Option<Executable>,
}

#[derive(Debug, Deserialize)]
struct Executable {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    #[serde(default)]
    result: Option<String>,
}

/// HTTP client for a Jenkins-compatible CI server.
pub struct JenkinsClient {
    base_url: String,
    username: String,
    token: String,
    job_name: String,
    trigger_timeout: Duration,
    log_timeout: Duration,
    http: reqwest::Client,
}

impl std::fmt::Debug for JenkinsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JenkinsClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("job_name", &self.job_name)
            .finish_non_exhaustive()
    }
}

impl JenkinsClient {
    pub fn new(credentials: CiCredentials, job_name: impl Into<String>) -> Self {
        Self {
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            username: credentials.username,
            token: credentials.token,
            job_name: job_name.into(),
            trigger_timeout: Duration::from_secs(10),
            log_timeout: Duration::from_secs(10),
            http: reqwest::Client::new(),
        }
    }

    /// Build a client from daemon config; fails when URL or credentials are missing.
    pub fn from_config(config: &Config) -> Result<Self> {
        let credentials = config.ci_credentials()?;
        Ok(Self::new(credentials, config.ci_job_name.clone())
            .with_timeouts(config.trigger_timeout(), config.log_timeout()))
    }

    pub fn with_timeouts(mut self, trigger: Duration, log: Duration) -> Self {
        self.trigger_timeout = trigger;
        self.log_timeout = log;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn job_url(&self, job_name: &str) -> String {
        format!("{}/job/{}", self.base_url, job_name)
    }

    /// Read a non-success response into an upstream error.
    async fn upstream_error(response: reqwest::Response) -> CiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        CiError::Upstream { status, body }
    }
}

#[async_trait]
impl CiApi for JenkinsClient {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    async fn trigger_build(&self, request: &BuildRequest) -> Result<QueueToken> {
        let url = format!("{}/buildWithParameters", self.job_url(&self.job_name));
        let form = trigger::build_parameters(request);

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.token))
            .form(&form)
            .timeout(self.trigger_timeout)
            .send()
            .await?;

        if !matches!(response.status(), StatusCode::CREATED | StatusCode::ACCEPTED) {
            return Err(Self::upstream_error(response).await);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok());
        Ok(trigger::queue_token_from_location(location))
    }

    async fn queue_item(&self, queue_id: QueueToken) -> Result<Option<u64>> {
        let url = format!("{}/queue/item/{}/api/json", self.base_url, queue_id);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.token))
            .timeout(self.trigger_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let item: QueueItemResponse = response.json().await?;
        debug!(queue_id = %queue_id, scheduled = item.executable.is_some(), "queue item status");
        Ok(item.executable.map(|e| e.number))
    }

    async fn build_result(&self, build: &BuildInstance) -> Result<Option<RemoteOutcome>> {
        let url = format!(
            "{}/{}/api/json",
            self.job_url(&build.job_name),
            build.build_number
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.token))
            .timeout(self.trigger_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let body: BuildResponse = response.json().await?;
        Ok(body
            .result
            .filter(|r| !r.is_empty())
            .map(|r| RemoteOutcome::from_remote(&r)))
    }

    async fn progressive_log(&self, build: &BuildInstance, offset: u64) -> Result<LogChunk> {
        let url = format!(
            "{}/{}/logText/progressiveText",
            self.job_url(&build.job_name),
            build.build_number
        );
        let response = self
            .http
            .get(&url)
            .query(&[("start", offset)])
            .basic_auth(&self.username, Some(&self.token))
            .timeout(self.log_timeout)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(Self::upstream_error(response).await);
        }

        let headers = response.headers();
        let text_size = headers
            .get(HEADER_TEXT_SIZE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let more_data = headers
            .get(HEADER_MORE_DATA)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;

        Ok(logs::chunk_from_response(
            offset,
            text,
            text_size.as_deref(),
            more_data.as_deref(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> JenkinsClient {
        JenkinsClient::new(
            CiCredentials {
                base_url: server.url(),
                username: "admin".to_string(),
                token: "api-token".to_string(),
            },
            "autodeploy",
        )
    }

    fn request() -> BuildRequest {
        BuildRequest::new("team1", "https://github.com/acme/shop").unwrap()
    }

    #[tokio::test]
    async fn trigger_returns_queue_id_from_location() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/job/autodeploy/buildWithParameters")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("PREFIX".into(), "team1".into()),
                Matcher::UrlEncoded("GIT_REPO".into(), "https://github.com/acme/shop".into()),
                Matcher::UrlEncoded("BRANCH".into(), "main".into()),
                Matcher::UrlEncoded("USE_REPO_DOCKERFILE".into(), "false".into()),
                Matcher::UrlEncoded("FRONTEND_STACK".into(), "react-vite".into()),
            ]))
            .with_status(201)
            .with_header("Location", "https://host/queue/item/42/")
            .create_async()
            .await;

        let token = client_for(&server).trigger_build(&request()).await.unwrap();

        assert_eq!(token, QueueToken(42));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn trigger_without_location_is_untrackable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/job/autodeploy/buildWithParameters")
            .with_status(201)
            .create_async()
            .await;

        let token = client_for(&server).trigger_build(&request()).await.unwrap();

        assert_eq!(token, QueueToken::UNTRACKABLE);
    }

    #[tokio::test]
    async fn trigger_rejects_unexpected_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/job/autodeploy/buildWithParameters")
            .with_status(403)
            .with_body("No valid crumb")
            .create_async()
            .await;

        let err = client_for(&server)
            .trigger_build(&request())
            .await
            .unwrap_err();

        match err {
            CiError::Upstream { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "No valid crumb");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_item_reports_executable_number() {
        let mut server = mockito::Server::new_async().await;
        let _pending = server
            .mock("GET", "/queue/item/5/api/json")
            .with_status(200)
            .with_body(r#"{"executable": null, "why": "Waiting for next available executor"}"#)
            .create_async()
            .await;
        let _scheduled = server
            .mock("GET", "/queue/item/6/api/json")
            .with_status(200)
            .with_body(r#"{"executable": {"number": 7, "url": "https://host/job/autodeploy/7/"}}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        assert_eq!(client.queue_item(QueueToken(5)).await.unwrap(), None);
        assert_eq!(client.queue_item(QueueToken(6)).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn build_result_is_none_while_running() {
        let mut server = mockito::Server::new_async().await;
        let _running = server
            .mock("GET", "/job/autodeploy/7/api/json")
            .with_status(200)
            .with_body(r#"{"building": true, "result": null}"#)
            .create_async()
            .await;
        let _done = server
            .mock("GET", "/job/autodeploy/8/api/json")
            .with_status(200)
            .with_body(r#"{"building": false, "result": "ABORTED"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let running = client
            .build_result(&BuildInstance::new("autodeploy", 7))
            .await
            .unwrap();
        let done = client
            .build_result(&BuildInstance::new("autodeploy", 8))
            .await
            .unwrap();

        assert_eq!(running, None);
        assert_eq!(done, Some(RemoteOutcome::Aborted));
    }

    #[tokio::test]
    async fn build_result_rejects_malformed_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/job/autodeploy/9/api/json")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let err = client_for(&server)
            .build_result(&BuildInstance::new("autodeploy", 9))
            .await
            .unwrap_err();

        assert!(matches!(err, CiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn progressive_log_uses_size_header() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/job/autodeploy/7/logText/progressiveText")
            .match_query(Matcher::UrlEncoded("start".into(), "0".into()))
            .with_status(200)
            .with_header("X-Text-Size", "5")
            .with_header("X-More-Data", "false")
            .with_body("hello")
            .create_async()
            .await;

        let chunk = client_for(&server)
            .progressive_log(&BuildInstance::new("autodeploy", 7), 0)
            .await
            .unwrap();

        assert_eq!(
            chunk,
            LogChunk {
                text: "hello".to_string(),
                next_offset: 5,
                has_more: false,
            }
        );
    }

    #[tokio::test]
    async fn progressive_log_without_size_header_advances_by_length() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/job/autodeploy/7/logText/progressiveText")
            .match_query(Matcher::UrlEncoded("start".into(), "10".into()))
            .with_status(200)
            .with_header("X-More-Data", "true")
            .with_body("hello")
            .create_async()
            .await;

        let chunk = client_for(&server)
            .progressive_log(&BuildInstance::new("autodeploy", 7), 10)
            .await
            .unwrap();

        assert_eq!(chunk.next_offset, 15);
        assert!(chunk.has_more);
    }

    #[tokio::test]
    async fn progressive_log_surfaces_upstream_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/job/autodeploy/99/logText/progressiveText")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let err = client_for(&server)
            .progressive_log(&BuildInstance::new("autodeploy", 99), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, CiError::Upstream { status: 404, .. }));
    }

    #[test]
    fn from_config_requires_credentials() {
        let config = Config::default();
        let err = JenkinsClient::from_config(&config).unwrap_err();
        assert!(matches!(err, CiError::Configuration(_)));
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn unconfigured_ci_fails_every_call() {
        let ci = UnconfiguredCi::new("autodeploy", "missing setting: DEPLOYD_CI_URL");
        assert!(ci.ensure_configured().is_err());
        let err = ci.queue_item(QueueToken(1)).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
