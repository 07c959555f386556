//! Deploy orchestration.
//!
//! One detached task per deploy runs trigger -> resolve -> poll -> reconcile and
//! finishes with exactly one terminal write to the deploy store. Errors from any
//! step end the run as FAILED with the error kind and message attached.

use std::sync::Arc;

use deploy_core::{
    reconcile, BuildInstance, BuildRequest, Config, DeployId, DeployProgress, DeployStatus,
    FailureDetail, FailureKind, RemoteOutcome, TerminalUpdate,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ci::{CiApi, CiError};
use crate::polling::PollBudget;
use crate::poller::wait_for_result;
use crate::resolver::resolve_queue_item;
use crate::storage::StorageError;
use crate::store::DeployStore;
use crate::trigger::trigger_build;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ci(#[from] CiError),
    #[error("build {build} finished with result {}", .outcome.as_str())]
    BuildFailed {
        build: BuildInstance,
        outcome: RemoteOutcome,
    },
    #[error("build {build} reported no result")]
    NoResult { build: BuildInstance },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl OrchestratorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Ci(e) => e.kind(),
            Self::BuildFailed { .. } | Self::NoResult { .. } => FailureKind::RemoteOutcome,
            Self::Storage(_) => FailureKind::Storage,
        }
    }

    pub fn detail(&self) -> FailureDetail {
        FailureDetail::new(self.kind(), self.to_string())
    }
}

/// Polling budgets for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub queue: PollBudget,
    pub build: PollBudget,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: PollBudget::new(config.queue_timeout(), config.queue_interval()),
            build: PollBudget::new(config.build_timeout(), config.build_interval()),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Handle to a spawned deploy run.
#[derive(Debug)]
pub struct DeployHandle {
    deploy_id: DeployId,
    progress: watch::Receiver<DeployProgress>,
    task: JoinHandle<DeployStatus>,
}

impl DeployHandle {
    pub fn deploy_id(&self) -> DeployId {
        self.deploy_id
    }

    /// Latest stage reached by the run.
    pub fn progress(&self) -> DeployProgress {
        self.progress.borrow().clone()
    }

    /// Receiver for stage changes.
    pub fn subscribe(&self) -> watch::Receiver<DeployProgress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end and return the status it wrote.
    ///
    /// A panicked or aborted task reports `InProgress`: no terminal write happened.
    pub async fn wait(self) -> DeployStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                error!(deploy_id = %self.deploy_id, error = %e, "deploy task did not complete");
                DeployStatus::InProgress
            }
        }
    }
}

/// Runs deploys against a CI system and records their terminal status.
#[derive(Clone)]
pub struct Orchestrator {
    ci: Arc<dyn CiApi>,
    store: Arc<dyn DeployStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(ci: Arc<dyn CiApi>, store: Arc<dyn DeployStore>, config: OrchestratorConfig) -> Self {
        Self { ci, store, config }
    }

    pub fn ci(&self) -> &Arc<dyn CiApi> {
        &self.ci
    }

    /// Start a detached run for an existing IN_PROGRESS deploy record.
    pub fn spawn(&self, deploy_id: DeployId, request: BuildRequest) -> DeployHandle {
        let (progress_tx, progress_rx) = watch::channel(DeployProgress::Triggering);
        let orchestrator = self.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run_deploy(deploy_id, &request, &progress_tx)
                .await
        });

        DeployHandle {
            deploy_id,
            progress: progress_rx,
            task,
        }
    }

    /// Drive one deploy to completion. Returns the status that was written.
    pub async fn run_deploy(
        &self,
        deploy_id: DeployId,
        request: &BuildRequest,
        progress: &watch::Sender<DeployProgress>,
    ) -> DeployStatus {
        info!(deploy_id = %deploy_id, prefix = request.prefix(), branch = request.branch(), "deploy started");

        let mut build_number = None;
        let update = match self
            .execute(request, progress, &mut build_number)
            .await
        {
            Ok(build) => TerminalUpdate::succeeded(build.build_number),
            Err(e) => {
                warn!(deploy_id = %deploy_id, kind = e.kind().as_str(), error = %e, "deploy failed");
                TerminalUpdate::failed(e.detail(), build_number)
            }
        };

        let status = update.status;
        match self.store.update_status(deploy_id, update).await {
            Ok(Some(_)) => {
                info!(deploy_id = %deploy_id, status = status.as_str(), "deploy finished");
            }
            Ok(None) => {
                warn!(deploy_id = %deploy_id, "deploy record vanished before terminal write");
            }
            Err(e) => {
                error!(deploy_id = %deploy_id, error = %e, "failed to record deploy status");
                progress.send_replace(DeployProgress::Finished {
                    status: DeployStatus::InProgress,
                });
                return DeployStatus::InProgress;
            }
        }

        progress.send_replace(DeployProgress::Finished { status });
        status
    }

    async fn execute(
        &self,
        request: &BuildRequest,
        progress: &watch::Sender<DeployProgress>,
        build_number: &mut Option<u64>,
    ) -> Result<BuildInstance, OrchestratorError> {
        let ci = self.ci.as_ref();

        let queue_id = trigger_build(ci, request).await?;
        progress.send_replace(DeployProgress::Queued { queue_id });

        let build = resolve_queue_item(ci, queue_id, self.config.queue).await?;
        *build_number = Some(build.build_number);
        progress.send_replace(DeployProgress::Building {
            build: build.clone(),
        });

        let outcome = wait_for_result(ci, &build, self.config.build).await?;
        match reconcile(Some(&outcome)) {
            DeployStatus::Success => Ok(build),
            DeployStatus::InProgress => Err(OrchestratorError::NoResult { build }),
            DeployStatus::Failed | DeployStatus::Archived => {
                Err(OrchestratorError::BuildFailed { build, outcome })
            }
        }
    }
}
