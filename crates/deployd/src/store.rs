//! Deploy record persistence seam used by the orchestrator.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use deploy_core::{Deploy, DeployId, DeployStatus, NewDeploy, TerminalUpdate};

use crate::storage::{Result, StorageError};

/// Deploy records as the pipeline sees them.
///
/// Implementations hand out a connection per call, so nothing is held across
/// the orchestrator's polling sleeps.
#[async_trait]
pub trait DeployStore: Send + Sync {
    /// Insert a new IN_PROGRESS record.
    async fn create(&self, deploy: NewDeploy) -> Result<Deploy>;

    async fn get(&self, id: DeployId) -> Result<Option<Deploy>>;

    /// Apply a terminal status; `None` when the record does not exist.
    async fn update_status(&self, id: DeployId, update: TerminalUpdate) -> Result<Option<Deploy>>;
}

/// In-memory store that remembers every terminal write.
#[derive(Debug, Default)]
pub struct MemoryDeployStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    deploys: BTreeMap<DeployId, Deploy>,
    writes: Vec<(DeployId, TerminalUpdate)>,
    fail_writes: bool,
}

impl MemoryDeployStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `update_status` fail.
    pub fn failing_writes(self) -> Self {
        self.lock().fail_writes = true;
        self
    }

    /// Terminal writes in the order they were applied.
    pub fn writes(&self) -> Vec<(DeployId, TerminalUpdate)> {
        self.lock().writes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl DeployStore for MemoryDeployStore {
    async fn create(&self, deploy: NewDeploy) -> Result<Deploy> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let record = Deploy {
            id: DeployId(inner.next_id),
            service_id: deploy.service_id,
            git_branch: deploy.git_branch,
            commit_id: deploy.commit_id,
            commit_message: deploy.commit_message,
            status: DeployStatus::InProgress,
            build_number: None,
            failure: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        inner.deploys.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: DeployId) -> Result<Option<Deploy>> {
        Ok(self.lock().deploys.get(&id).cloned())
    }

    async fn update_status(&self, id: DeployId, update: TerminalUpdate) -> Result<Option<Deploy>> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StorageError::Io("store is read-only".to_string()));
        }
        inner.writes.push((id, update.clone()));
        let Some(record) = inner.deploys.get_mut(&id) else {
            return Ok(None);
        };
        record.status = update.status;
        record.build_number = update.build_number.or(record.build_number);
        record.failure = update.failure;
        record.updated_at = Some(Utc::now());
        Ok(Some(record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::{FailureDetail, FailureKind, ServiceId};

    fn new_deploy() -> NewDeploy {
        NewDeploy {
            service_id: ServiceId(1),
            git_branch: "main".to_string(),
            commit_id: "abc123".to_string(),
            commit_message: "initial".to_string(),
        }
    }

    #[tokio::test]
    async fn create_assigns_ids_in_order() {
        let store = MemoryDeployStore::new();
        let first = store.create(new_deploy()).await.unwrap();
        let second = store.create(new_deploy()).await.unwrap();

        assert_eq!(first.id, DeployId(1));
        assert_eq!(second.id, DeployId(2));
        assert_eq!(first.status, DeployStatus::InProgress);
    }

    #[tokio::test]
    async fn update_records_write_and_failure_detail() {
        let store = MemoryDeployStore::new();
        let deploy = store.create(new_deploy()).await.unwrap();
        let detail = FailureDetail::new(FailureKind::PollTimeout, "build did not finish");

        let updated = store
            .update_status(deploy.id, TerminalUpdate::failed(detail.clone(), Some(9)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, DeployStatus::Failed);
        assert_eq!(updated.build_number, Some(9));
        assert_eq!(updated.failure, Some(detail));
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_record_returns_none() {
        let store = MemoryDeployStore::new();
        let result = store
            .update_status(DeployId(99), TerminalUpdate::succeeded(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
