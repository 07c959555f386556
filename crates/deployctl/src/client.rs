//! HTTP client for the deployd daemon.

use std::time::{Duration, Instant};

use deploy_core::{Deploy, DeployProgress, Log, LogChunk, Service};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound for waiting on a deploy: the daemon's queue and build budgets plus slack.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(35 * 60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: deployd\n  → or set DEPLOYD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /deploys.
#[derive(Debug, Default, Serialize)]
pub struct CreateDeployRequest {
    pub service_id: i64,
    pub prefix: String,
    pub git_repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub use_repo_dockerfile: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_pat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateServiceRequest {
    pub user_id: i64,
    pub name: String,
    pub domain: String,
    pub git_repo: String,
}

/// Deploy record with live progress, when the daemon is tracking the run.
#[derive(Debug, Deserialize)]
pub struct DeployResponse {
    pub deploy: Deploy,
    #[serde(default)]
    pub progress: Option<DeployProgress>,
}

#[derive(Debug, Deserialize)]
struct DeployListResponse {
    deploys: Vec<Deploy>,
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    service: Service,
}

#[derive(Debug, Deserialize)]
struct ServiceListResponse {
    services: Vec<Service>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP client for deployd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            404 => ClientError::NotFound(message),
            502 => ClientError::Upstream(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// POST /deploys
    pub async fn create_deploy(&self, req: &CreateDeployRequest) -> Result<DeployResponse, ClientError> {
        self.post_json("/deploys", req).await
    }

    /// GET /deploys/{id}
    pub async fn get_deploy(&self, deploy_id: i64) -> Result<DeployResponse, ClientError> {
        self.get_json(&format!("/deploys/{deploy_id}")).await
    }

    /// Poll a deploy until it leaves IN_PROGRESS or `max_wait` elapses.
    ///
    /// A record still IN_PROGRESS when the wait ends is returned as is; its outcome is unknown.
    pub async fn wait_for_deploy(
        &self,
        deploy_id: i64,
        interval: Duration,
        max_wait: Duration,
        mut on_progress: impl FnMut(&DeployProgress),
    ) -> Result<DeployResponse, ClientError> {
        let start = Instant::now();
        loop {
            let response = self.get_deploy(deploy_id).await?;
            if response.deploy.status.is_terminal() {
                return Ok(response);
            }

            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return Ok(response);
            }
            if let Some(ref progress) = response.progress {
                on_progress(progress);
            }

            let remaining = max_wait.saturating_sub(elapsed);
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    /// GET /deploys/{id}/log
    pub async fn get_deploy_log(&self, deploy_id: i64) -> Result<Log, ClientError> {
        self.get_json(&format!("/deploys/{deploy_id}/log")).await
    }

    /// GET /services/{id}/deploys?limit=
    pub async fn list_deploys(
        &self,
        service_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Deploy>, ClientError> {
        let path = match limit {
            Some(limit) => format!("/services/{service_id}/deploys?limit={limit}"),
            None => format!("/services/{service_id}/deploys"),
        };
        let body: DeployListResponse = self.get_json(&path).await?;
        Ok(body.deploys)
    }

    /// POST /services
    pub async fn create_service(&self, req: &CreateServiceRequest) -> Result<Service, ClientError> {
        let body: ServiceResponse = self.post_json("/services", req).await?;
        Ok(body.service)
    }

    /// GET /users/{id}/services
    pub async fn list_services(&self, user_id: i64) -> Result<Vec<Service>, ClientError> {
        let body: ServiceListResponse = self.get_json(&format!("/users/{user_id}/services")).await?;
        Ok(body.services)
    }

    /// GET /ci/logs/{build_number}?offset=
    pub async fn log_chunk(&self, build_number: u64, offset: u64) -> Result<LogChunk, ClientError> {
        self.get_json(&format!("/ci/logs/{build_number}?offset={offset}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::DeployStatus;
    use mockito::Matcher;

    fn deploy_json(status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": 5,
            "service_id": 2,
            "git_branch": "main",
            "commit_id": "abc123",
            "commit_message": "ship it",
            "status": status,
            "build_number": null,
            "failure": null,
            "created_at": "2026-01-05T10:00:00Z",
            "updated_at": null,
        })
    }

    #[tokio::test]
    async fn create_deploy_sends_only_set_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/deploys")
            .match_body(Matcher::Json(serde_json::json!({
                "service_id": 2,
                "prefix": "team1",
                "git_repo": "https://github.com/acme/shop",
                "use_repo_dockerfile": false,
            })))
            .with_status(202)
            .with_body(
                serde_json::json!({
                    "deploy": deploy_json("IN_PROGRESS"),
                    "progress": { "stage": "triggering" },
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = Client::new(&server.url());
        let response = client
            .create_deploy(&CreateDeployRequest {
                service_id: 2,
                prefix: "team1".to_string(),
                git_repo: "https://github.com/acme/shop".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.deploy.status, DeployStatus::InProgress);
        assert_eq!(response.progress, Some(DeployProgress::Triggering));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn wait_returns_once_deploy_finishes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/deploys/5")
            .with_status(200)
            .with_body(serde_json::json!({ "deploy": deploy_json("SUCCESS") }).to_string())
            .expect(1)
            .create_async()
            .await;

        let response = Client::new(&server.url())
            .wait_for_deploy(5, Duration::from_millis(10), Duration::from_secs(5), |_| {})
            .await
            .unwrap();

        assert_eq!(response.deploy.status, DeployStatus::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn wait_gives_up_on_stuck_deploy() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/deploys/5")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "deploy": deploy_json("IN_PROGRESS"),
                    "progress": { "stage": "triggering" },
                })
                .to_string(),
            )
            .expect_at_least(2)
            .create_async()
            .await;

        let mut stages = 0;
        let response = Client::new(&server.url())
            .wait_for_deploy(5, Duration::from_millis(20), Duration::from_millis(100), |_| {
                stages += 1;
            })
            .await
            .unwrap();

        assert_eq!(response.deploy.status, DeployStatus::InProgress);
        assert!(stages >= 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_maps_to_error_variant() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/deploys/9")
            .with_status(404)
            .with_body(r#"{"error":"deploy not found: 9"}"#)
            .create_async()
            .await;

        let err = Client::new(&server.url()).get_deploy(9).await.unwrap_err();

        assert!(matches!(err, ClientError::NotFound(msg) if msg.contains("9")));
    }

    #[tokio::test]
    async fn log_chunk_reads_wire_fields() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/ci/logs/7")
            .match_query(Matcher::UrlEncoded("offset".into(), "10".into()))
            .with_status(200)
            .with_body(r#"{"chunk":"hello","nextOffset":15,"hasMore":false}"#)
            .create_async()
            .await;

        let chunk = Client::new(&server.url()).log_chunk(7, 10).await.unwrap();

        assert_eq!(chunk.text, "hello");
        assert_eq!(chunk.next_offset, 15);
        assert!(!chunk.has_more);
    }

    #[tokio::test]
    async fn bad_gateway_is_upstream() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/ci/logs/7")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body(r#"{"error":"CI returned HTTP 404: "}"#)
            .create_async()
            .await;

        let err = Client::new(&server.url()).log_chunk(7, 0).await.unwrap_err();

        assert!(matches!(err, ClientError::Upstream(_)));
    }
}
