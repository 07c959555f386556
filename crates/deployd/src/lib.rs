//! deployd - deploy trigger and CI status reconciliation daemon
//!
//! Library components for the daemon process.

pub mod ci;
pub mod fakes;
pub mod logs;
pub mod orchestrator;
pub mod poller;
pub mod polling;
pub mod repo;
pub mod resolver;
pub mod server;
pub mod storage;
pub mod store;
pub mod trigger;

use std::path::PathBuf;
use std::sync::Arc;

use ci::{CiApi, JenkinsClient, UnconfiguredCi};
use deploy_core::Config;
use eyre::WrapErr;
use orchestrator::{Orchestrator, OrchestratorConfig};
use repo::GitHubMetadata;
use server::{AppState, DeployTracker};
use storage::Storage;
use store::DeployStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Get the default database path (~/.local/share/deployd/deployd.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("deployd").join("deployd.db")
}

/// CI client for the configured endpoint, or a stand-in that reports what is missing.
pub fn ci_from_config(config: &Config) -> Arc<dyn CiApi> {
    match JenkinsClient::from_config(config) {
        Ok(client) => {
            info!(ci_url = client.base_url(), job = %config.ci_job_name, "CI client configured");
            Arc::new(client)
        }
        Err(e) => {
            warn!(error = %e, "CI is not configured; deploys and log reads will be rejected");
            Arc::new(UnconfiguredCi::new(config.ci_job_name.clone(), e.to_string()))
        }
    }
}

/// Daemon state.
pub struct Daemon {
    config: Config,
    db_path: PathBuf,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open storage and wire the pipeline from configuration.
    pub async fn new(config: Config) -> eyre::Result<Self> {
        config
            .validate_budgets()
            .wrap_err("invalid polling configuration")?;
        let db_path = config.db_path.clone().unwrap_or_else(default_db_path);
        let storage = Storage::new(&db_path)
            .await
            .wrap_err_with(|| format!("failed to open database at {}", db_path.display()))?;
        storage
            .migrate_embedded()
            .await
            .wrap_err("failed to apply migrations")?;
        let storage = Arc::new(storage);

        let store: Arc<dyn DeployStore> = storage.clone();
        let orchestrator = Orchestrator::new(
            ci_from_config(&config),
            store,
            OrchestratorConfig::from_config(&config),
        );

        let state = Arc::new(AppState {
            storage,
            orchestrator,
            repo: Arc::new(GitHubMetadata::new(config.github_api.clone())),
            tracker: DeployTracker::new(),
        });

        Ok(Self {
            config,
            db_path,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.state.storage
    }

    /// HTTP routes over this daemon's state.
    pub fn router(&self) -> axum::Router {
        server::create_router(Arc::clone(&self.state))
    }

    /// Serve the HTTP API until `shutdown` is called.
    pub async fn run(&self) -> eyre::Result<()> {
        info!(listen = %self.config.listen_addr, "deployd starting");
        info!(database = %self.db_path.display(), "storage ready");
        info!(
            queue_timeout_sec = self.config.queue_timeout_sec,
            build_timeout_sec = self.config.build_timeout_sec,
            "polling budgets"
        );

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .wrap_err_with(|| format!("failed to bind {}", self.config.listen_addr))?;
        info!("HTTP server listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await
            .wrap_err("HTTP server error")?;

        let abandoned = self.state.tracker.active();
        if abandoned > 0 {
            warn!(abandoned, "shutting down with deploys still in progress");
        }
        info!("deployd stopped");
        Ok(())
    }

    /// Signal the daemon to stop accepting requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
