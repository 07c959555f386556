//! SQLite storage for the deploy daemon.
//!
//! Persists users, services, deploys and stored deploy logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deploy_core::{
    Deploy, DeployId, DeployStatus, FailureDetail, FailureKind, Log, NewDeploy, NewService,
    Service, ServiceId, TerminalUpdate, User, UserId,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

use crate::store::DeployStore;

const DEPLOYS_COLUMNS: &str = "deploy_id, service_id, git_branch, commit_id, commit_message, \
    status, build_number, failure_kind, failure_message, created_at, updated_at";

const SERVICES_COLUMNS: &str =
    "service_id, user_id, name, domain, git_repo, created_at, updated_at";

const LOGS_COLUMNS: &str =
    "log_id, deploy_id, build_log, deploy_log, application_log, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("user not found: {0}")]
    UserNotFound(i64),
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the compiled-in schema. Safe to run on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Users ---

    pub async fn insert_user(&self, email: &str, is_active: bool) -> Result<User> {
        let created_at = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (email, is_active, created_at) VALUES (?1, ?2, ?3) RETURNING user_id",
        )
        .bind(email)
        .bind(is_active)
        .bind(created_at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(User {
            id: UserId(id),
            email: email.to_string(),
            is_active,
            created_at: millis_to_datetime(created_at.timestamp_millis()),
        })
    }

    pub async fn get_user(&self, id: UserId) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, email, is_active, created_at FROM users WHERE user_id = ?1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::UserNotFound(id.0))?;

        Ok(row.into_user())
    }

    // --- Services ---

    pub async fn insert_service(&self, service: &NewService) -> Result<Service> {
        let created_at = Utc::now().timestamp_millis();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO services (user_id, name, domain, git_repo, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING service_id
            "#,
        )
        .bind(service.user_id.0)
        .bind(&service.name)
        .bind(&service.domain)
        .bind(&service.git_repo)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        self.get_service(ServiceId(id)).await
    }

    pub async fn get_service(&self, id: ServiceId) -> Result<Service> {
        let query = format!("SELECT {SERVICES_COLUMNS} FROM services WHERE service_id = ?1");
        let row = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::ServiceNotFound(id))?;

        Ok(row.into_service())
    }

    pub async fn list_services_for_user(&self, user_id: UserId) -> Result<Vec<Service>> {
        let query = format!(
            "SELECT {SERVICES_COLUMNS} FROM services WHERE user_id = ?1 ORDER BY service_id"
        );
        let rows = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ServiceRow::into_service).collect())
    }

    // --- Deploys ---

    pub async fn create_deploy(&self, deploy: &NewDeploy) -> Result<Deploy> {
        let created_at = Utc::now().timestamp_millis();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO deploys (service_id, git_branch, commit_id, commit_message, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING deploy_id
            "#,
        )
        .bind(deploy.service_id.0)
        .bind(&deploy.git_branch)
        .bind(&deploy.commit_id)
        .bind(&deploy.commit_message)
        .bind(DeployStatus::InProgress.as_str())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Deploy {
            id: DeployId(id),
            service_id: deploy.service_id,
            git_branch: deploy.git_branch.clone(),
            commit_id: deploy.commit_id.clone(),
            commit_message: deploy.commit_message.clone(),
            status: DeployStatus::InProgress,
            build_number: None,
            failure: None,
            created_at: millis_to_datetime(created_at),
            updated_at: None,
        })
    }

    pub async fn get_deploy(&self, id: DeployId) -> Result<Option<Deploy>> {
        let query = format!("SELECT {DEPLOYS_COLUMNS} FROM deploys WHERE deploy_id = ?1");
        let row = sqlx::query_as::<_, DeployRow>(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(DeployRow::into_deploy))
    }

    /// Most recent deploys of a service, newest first.
    pub async fn list_deploys_for_service(
        &self,
        service_id: ServiceId,
        limit: u32,
    ) -> Result<Vec<Deploy>> {
        let query = format!(
            "SELECT {DEPLOYS_COLUMNS} FROM deploys WHERE service_id = ?1 \
             ORDER BY created_at DESC, deploy_id DESC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, DeployRow>(&query)
            .bind(service_id.0)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(DeployRow::into_deploy).collect())
    }

    /// Write status, build number and failure detail in one statement.
    pub async fn update_deploy_terminal(
        &self,
        id: DeployId,
        update: &TerminalUpdate,
    ) -> Result<Option<Deploy>> {
        let build_number = update.build_number.and_then(|n| i64::try_from(n).ok());
        let (failure_kind, failure_message) = match &update.failure {
            Some(f) => (Some(f.kind.as_str()), Some(f.message.as_str())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE deploys
            SET status = ?1,
                build_number = COALESCE(?2, build_number),
                failure_kind = ?3,
                failure_message = ?4,
                updated_at = ?5
            WHERE deploy_id = ?6
            "#,
        )
        .bind(update.status.as_str())
        .bind(build_number)
        .bind(failure_kind)
        .bind(failure_message)
        .bind(Utc::now().timestamp_millis())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_deploy(id).await
    }

    // --- Logs ---

    pub async fn insert_log(
        &self,
        deploy_id: DeployId,
        build_log: Option<&str>,
        deploy_log: Option<&str>,
        application_log: Option<&str>,
    ) -> Result<Log> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO logs (deploy_id, build_log, deploy_log, application_log, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING log_id
            "#,
        )
        .bind(deploy_id.0)
        .bind(build_log)
        .bind(deploy_log)
        .bind(application_log)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        let query = format!("SELECT {LOGS_COLUMNS} FROM logs WHERE log_id = ?1");
        let row = sqlx::query_as::<_, LogRow>(&query)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into_log())
    }

    /// Latest stored log for a deploy.
    pub async fn get_log_for_deploy(&self, deploy_id: DeployId) -> Result<Option<Log>> {
        let query = format!(
            "SELECT {LOGS_COLUMNS} FROM logs WHERE deploy_id = ?1 ORDER BY log_id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, LogRow>(&query)
            .bind(deploy_id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(LogRow::into_log))
    }
}

#[async_trait]
impl DeployStore for Storage {
    async fn create(&self, deploy: NewDeploy) -> Result<Deploy> {
        self.create_deploy(&deploy).await
    }

    async fn get(&self, id: DeployId) -> Result<Option<Deploy>> {
        self.get_deploy(id).await
    }

    async fn update_status(&self, id: DeployId, update: TerminalUpdate) -> Result<Option<Deploy>> {
        self.update_deploy_terminal(id, &update).await
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// --- Row types ---

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    email: String,
    is_active: bool,
    created_at: i64,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: UserId(self.user_id),
            email: self.email,
            is_active: self.is_active,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    service_id: i64,
    user_id: i64,
    name: String,
    domain: String,
    git_repo: String,
    created_at: i64,
    updated_at: Option<i64>,
}

impl ServiceRow {
    fn into_service(self) -> Service {
        Service {
            id: ServiceId(self.service_id),
            user_id: UserId(self.user_id),
            name: self.name,
            domain: self.domain,
            git_repo: self.git_repo,
            created_at: millis_to_datetime(self.created_at),
            updated_at: self.updated_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeployRow {
    deploy_id: i64,
    service_id: i64,
    git_branch: String,
    commit_id: String,
    commit_message: String,
    status: String,
    build_number: Option<i64>,
    failure_kind: Option<String>,
    failure_message: Option<String>,
    created_at: i64,
    updated_at: Option<i64>,
}

impl DeployRow {
    fn into_deploy(self) -> Deploy {
        let failure = self.failure_kind.map(|kind| {
            FailureDetail::new(
                FailureKind::parse(&kind).unwrap_or(FailureKind::Upstream),
                self.failure_message.unwrap_or_default(),
            )
        });

        Deploy {
            id: DeployId(self.deploy_id),
            service_id: ServiceId(self.service_id),
            git_branch: self.git_branch,
            commit_id: self.commit_id,
            commit_message: self.commit_message,
            status: DeployStatus::parse(&self.status).unwrap_or(DeployStatus::Failed),
            build_number: self.build_number.and_then(|n| u64::try_from(n).ok()),
            failure,
            created_at: millis_to_datetime(self.created_at),
            updated_at: self.updated_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    log_id: i64,
    deploy_id: i64,
    build_log: Option<String>,
    deploy_log: Option<String>,
    application_log: Option<String>,
    created_at: i64,
    updated_at: Option<i64>,
}

impl LogRow {
    fn into_log(self) -> Log {
        Log {
            id: self.log_id,
            deploy_id: DeployId(self.deploy_id),
            build_log: self.build_log,
            deploy_log: self.deploy_log,
            application_log: self.application_log,
            created_at: millis_to_datetime(self.created_at),
            updated_at: self.updated_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    async fn create_service(storage: &Storage) -> Service {
        let user = storage.insert_user("dev@example.com", true).await.unwrap();
        storage
            .insert_service(&NewService {
                user_id: user.id,
                name: "shop".to_string(),
                domain: "shop.example.com".to_string(),
                git_repo: "https://github.com/acme/shop".to_string(),
            })
            .await
            .unwrap()
    }

    fn new_deploy(service_id: ServiceId, commit: &str) -> NewDeploy {
        NewDeploy {
            service_id,
            git_branch: "main".to_string(),
            commit_id: commit.to_string(),
            commit_message: format!("commit {commit}"),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
    }

    #[tokio::test]
    async fn insert_and_get_user() {
        let ts = create_test_storage().await;
        let user = ts.storage.insert_user("a@example.com", false).await.unwrap();

        let fetched = ts.storage.get_user(user.id).await.unwrap();

        assert_eq!(fetched.email, "a@example.com");
        assert!(!fetched.is_active);
    }

    #[tokio::test]
    async fn get_missing_service_is_not_found() {
        let ts = create_test_storage().await;
        let err = ts.storage.get_service(ServiceId(404)).await.unwrap_err();
        assert!(matches!(err, StorageError::ServiceNotFound(ServiceId(404))));
    }

    #[tokio::test]
    async fn services_listed_for_owner() {
        let ts = create_test_storage().await;
        let service = create_service(&ts.storage).await;

        let services = ts
            .storage
            .list_services_for_user(service.user_id)
            .await
            .unwrap();

        assert_eq!(services, vec![service]);
    }

    #[tokio::test]
    async fn deploy_starts_in_progress() {
        let ts = create_test_storage().await;
        let service = create_service(&ts.storage).await;

        let deploy = ts
            .storage
            .create_deploy(&new_deploy(service.id, "a1b2c3"))
            .await
            .unwrap();
        let fetched = ts.storage.get_deploy(deploy.id).await.unwrap().unwrap();

        assert_eq!(fetched.status, DeployStatus::InProgress);
        assert_eq!(fetched.commit_id, "a1b2c3");
        assert!(fetched.build_number.is_none());
        assert!(fetched.failure.is_none());
    }

    #[tokio::test]
    async fn terminal_update_persists_failure_detail() {
        let ts = create_test_storage().await;
        let service = create_service(&ts.storage).await;
        let deploy = ts
            .storage
            .create_deploy(&new_deploy(service.id, "a1b2c3"))
            .await
            .unwrap();
        let detail = FailureDetail::new(FailureKind::ResolutionTimeout, "queue item 4 stuck");

        let updated = ts
            .storage
            .update_deploy_terminal(deploy.id, &TerminalUpdate::failed(detail.clone(), None))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, DeployStatus::Failed);
        assert_eq!(updated.failure, Some(detail));
        assert!(updated.updated_at.is_some());
    }

    #[tokio::test]
    async fn terminal_update_records_build_number() {
        let ts = create_test_storage().await;
        let service = create_service(&ts.storage).await;
        let deploy = ts
            .storage
            .create_deploy(&new_deploy(service.id, "a1b2c3"))
            .await
            .unwrap();

        let updated = DeployStore::update_status(
            &ts.storage,
            deploy.id,
            TerminalUpdate::succeeded(17),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(updated.status, DeployStatus::Success);
        assert_eq!(updated.build_number, Some(17));
    }

    #[tokio::test]
    async fn terminal_update_of_missing_deploy_is_none() {
        let ts = create_test_storage().await;
        let result = ts
            .storage
            .update_deploy_terminal(DeployId(12), &TerminalUpdate::succeeded(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn recent_deploys_are_newest_first_and_limited() {
        let ts = create_test_storage().await;
        let service = create_service(&ts.storage).await;
        for commit in ["c1", "c2", "c3", "c4", "c5"] {
            ts.storage
                .create_deploy(&new_deploy(service.id, commit))
                .await
                .unwrap();
        }

        let recent = ts
            .storage
            .list_deploys_for_service(service.id, 4)
            .await
            .unwrap();

        let commits: Vec<_> = recent.iter().map(|d| d.commit_id.as_str()).collect();
        assert_eq!(commits, vec!["c5", "c4", "c3", "c2"]);
    }

    #[tokio::test]
    async fn latest_log_is_returned() {
        let ts = create_test_storage().await;
        let service = create_service(&ts.storage).await;
        let deploy = ts
            .storage
            .create_deploy(&new_deploy(service.id, "a1b2c3"))
            .await
            .unwrap();

        assert!(ts.storage.get_log_for_deploy(deploy.id).await.unwrap().is_none());

        ts.storage
            .insert_log(deploy.id, Some("old build"), None, None)
            .await
            .unwrap();
        ts.storage
            .insert_log(deploy.id, Some("new build"), Some("rolled out"), None)
            .await
            .unwrap();

        let log = ts.storage.get_log_for_deploy(deploy.id).await.unwrap().unwrap();
        assert_eq!(log.build_log.as_deref(), Some("new build"));
        assert_eq!(log.deploy_log.as_deref(), Some("rolled out"));
        assert!(log.application_log.is_none());
    }
}
