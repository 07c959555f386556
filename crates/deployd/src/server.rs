//! HTTP control plane for deployd.
//!
//! Thin routing over the deploy pipeline: records are created here, runs are
//! handed to the orchestrator and tracked for progress inspection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use deploy_core::request::BuildRequestInput;
use deploy_core::{
    BuildInstance, Deploy, DeployId, DeployProgress, NewDeploy, NewService, Service, ServiceId,
    UserId,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::ci::CiError;
use crate::logs::fetch_log_chunk;
use crate::orchestrator::{DeployHandle, Orchestrator};
use crate::repo::RepoMetadata;
use crate::storage::{Storage, StorageError};

/// Deploys returned by the recent-deploys listing when no limit is given.
pub const DEFAULT_RECENT_LIMIT: u32 = 4;

/// Handles of runs started by this process.
#[derive(Debug, Default)]
pub struct DeployTracker {
    handles: Mutex<HashMap<DeployId, DeployHandle>>,
}

impl DeployTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a run, dropping handles of runs that already ended.
    pub fn insert(&self, handle: DeployHandle) {
        let mut handles = self.lock();
        handles.retain(|_, h| !h.is_finished());
        handles.insert(handle.deploy_id(), handle);
    }

    pub fn progress(&self, id: DeployId) -> Option<DeployProgress> {
        self.lock().get(&id).map(DeployHandle::progress)
    }

    /// Remove a run's handle so the caller can await it.
    pub fn take(&self, id: DeployId) -> Option<DeployHandle> {
        self.lock().remove(&id)
    }

    pub fn active(&self) -> usize {
        self.lock().values().filter(|h| !h.is_finished()).count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeployId, DeployHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub orchestrator: Orchestrator,
    pub repo: Arc<dyn RepoMetadata>,
    pub tracker: DeployTracker,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/deploys", post(create_deploy))
        .route("/deploys/{id}", get(get_deploy))
        .route("/deploys/{id}/log", get(get_deploy_log))
        .route("/services", post(create_service))
        .route("/services/{id}", get(get_service))
        .route("/services/{id}/deploys", get(list_service_deploys))
        .route("/users/{id}/services", get(list_user_services))
        .route("/ci/logs/{build_number}", get(get_ci_log_chunk))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn ci_error(e: &CiError) -> ApiError {
    let status = match e {
        CiError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CiError::Upstream { .. } | CiError::Transport(_) | CiError::InvalidResponse(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

fn storage_error(e: &StorageError) -> ApiError {
    match e {
        StorageError::ServiceNotFound(_) | StorageError::UserNotFound(_) => {
            api_error(StatusCode::NOT_FOUND, e.to_string())
        }
        _ => {
            error!(error = %e, "storage failure");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Request payload for POST /deploys.
#[derive(Debug, Deserialize)]
pub struct CreateDeployRequest {
    pub service_id: ServiceId,
    #[serde(flatten)]
    pub build: BuildRequestInput,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub deploy: Deploy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<DeployProgress>,
}

#[derive(Debug, Serialize)]
pub struct DeployListResponse {
    pub deploys: Vec<Deploy>,
}

#[derive(Debug, Deserialize)]
pub struct RecentDeploysQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub user_id: UserId,
    pub name: String,
    pub domain: String,
    pub git_repo: String,
}

#[derive(Debug, Serialize)]
pub struct ServiceResponse {
    pub service: Service,
}

#[derive(Debug, Serialize)]
pub struct ServiceListResponse {
    pub services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
pub struct LogChunkQuery {
    #[serde(default)]
    pub offset: u64,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /deploys - Record a deploy and start its run.
async fn create_deploy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .orchestrator
        .ci()
        .ensure_configured()
        .map_err(|e| ci_error(&e))?;

    let request = req
        .build
        .validate()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    state
        .storage
        .get_service(req.service_id)
        .await
        .map_err(|e| storage_error(&e))?;

    let (commit_id, commit_message) = match (req.commit_id, req.commit_message) {
        (Some(id), message) => (id, message.unwrap_or_default()),
        (None, _) => {
            let commit = state
                .repo
                .latest_commit(request.repository_url(), request.branch())
                .await
                .map_err(|e| {
                    warn!(repo = %request.repository_url(), error = %e, "commit lookup failed");
                    api_error(StatusCode::BAD_GATEWAY, e.to_string())
                })?;
            (commit.short_id, commit.message)
        }
    };

    let deploy = state
        .storage
        .create_deploy(&NewDeploy {
            service_id: req.service_id,
            git_branch: request.branch().to_string(),
            commit_id,
            commit_message,
        })
        .await
        .map_err(|e| storage_error(&e))?;

    let handle = state.orchestrator.spawn(deploy.id, request);
    let progress = handle.progress();
    state.tracker.insert(handle);

    info!(deploy_id = %deploy.id, service_id = %deploy.service_id, commit = %deploy.commit_id, "deploy accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            deploy,
            progress: Some(progress),
        }),
    ))
}

/// GET /deploys/{id}
async fn get_deploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let id = DeployId(id);
    let deploy = state
        .storage
        .get_deploy(id)
        .await
        .map_err(|e| storage_error(&e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("deploy not found: {id}")))?;

    Ok(Json(DeployResponse {
        deploy,
        progress: state.tracker.progress(id),
    }))
}

/// GET /deploys/{id}/log - Stored log record.
async fn get_deploy_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let id = DeployId(id);
    let log = state
        .storage
        .get_log_for_deploy(id)
        .await
        .map_err(|e| storage_error(&e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no log for deploy {id}")))?;

    Ok(Json(log))
}

/// POST /services
async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateServiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .storage
        .get_user(req.user_id)
        .await
        .map_err(|e| storage_error(&e))?;

    let service = state
        .storage
        .insert_service(&NewService {
            user_id: req.user_id,
            name: req.name,
            domain: req.domain,
            git_repo: req.git_repo,
        })
        .await
        .map_err(|e| storage_error(&e))?;

    info!(service_id = %service.id, name = %service.name, "created service");
    Ok((StatusCode::CREATED, Json(ServiceResponse { service })))
}

/// GET /services/{id}
async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state
        .storage
        .get_service(ServiceId(id))
        .await
        .map_err(|e| storage_error(&e))?;

    Ok(Json(ServiceResponse { service }))
}

/// GET /services/{id}/deploys - Most recent deploys, newest first.
async fn list_service_deploys(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<RecentDeploysQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let deploys = state
        .storage
        .list_deploys_for_service(ServiceId(id), query.limit.unwrap_or(DEFAULT_RECENT_LIMIT))
        .await
        .map_err(|e| storage_error(&e))?;

    Ok(Json(DeployListResponse { deploys }))
}

/// GET /users/{id}/services
async fn list_user_services(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let services = state
        .storage
        .list_services_for_user(UserId(id))
        .await
        .map_err(|e| storage_error(&e))?;

    Ok(Json(ServiceListResponse { services }))
}

/// GET /ci/logs/{build_number}?offset= - One progressive log read.
async fn get_ci_log_chunk(
    State(state): State<Arc<AppState>>,
    Path(build_number): Path<u64>,
    Query(query): Query<LogChunkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ci = state.orchestrator.ci().as_ref();
    let build = BuildInstance::new(ci.job_name(), build_number);

    let chunk = fetch_log_chunk(ci, &build, query.offset)
        .await
        .map_err(|e| {
            warn!(build = %build, offset = query.offset, error = %e, "log fetch failed");
            ci_error(&e)
        })?;

    Ok(Json(chunk))
}
