//! Core types for the deploy service.
//!
//! Records mirror the relational model (users, services, deploys, logs) and the
//! CI-facing types used by the trigger/resolve/poll pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a deploy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployId(pub i64);

impl std::fmt::Display for DeployId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub i64);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Pending build placement inside the CI admission queue.
///
/// Only meaningful until the CI system assigns a build number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueToken(pub i64);

impl QueueToken {
    /// The CI system accepted the build but gave no usable queue location.
    pub const UNTRACKABLE: Self = Self(-1);

    pub fn is_trackable(&self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for QueueToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One concrete, numbered execution of a CI job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildInstance {
    pub job_name: String,
    pub build_number: u64,
}

impl BuildInstance {
    pub fn new(job_name: impl Into<String>, build_number: u64) -> Self {
        Self {
            job_name: job_name.into(),
            build_number,
        }
    }
}

impl std::fmt::Display for BuildInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.job_name, self.build_number)
    }
}

// --- Enumerations ---

/// Terminal result reported by the CI system for a finished build.
///
/// A build that is still running has no outcome; callers model that as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOutcome {
    Success,
    Failure,
    Aborted,
    Unstable,
    NotBuilt,
    /// A result string this service does not recognize.
    Other(String),
}

impl RemoteOutcome {
    /// Parse the CI system's result string.
    pub fn from_remote(value: &str) -> Self {
        match value {
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            "ABORTED" => Self::Aborted,
            "UNSTABLE" => Self::Unstable,
            "NOT_BUILT" => Self::NotBuilt,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
            Self::Unstable => "UNSTABLE",
            Self::NotBuilt => "NOT_BUILT",
            Self::Other(value) => value,
        }
    }
}

/// Durable deploy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    #[default]
    InProgress,
    Success,
    Failed,
    Archived,
}

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Category of the error that ended a deploy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Validation,
    Upstream,
    Transport,
    InvalidResponse,
    ResolutionTimeout,
    PollTimeout,
    Untrackable,
    Storage,
    /// The build ran and the CI system reported a non-success result.
    RemoteOutcome,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Upstream => "upstream",
            Self::Transport => "transport",
            Self::InvalidResponse => "invalid_response",
            Self::ResolutionTimeout => "resolution_timeout",
            Self::PollTimeout => "poll_timeout",
            Self::Untrackable => "untrackable",
            Self::Storage => "storage",
            Self::RemoteOutcome => "remote_outcome",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "configuration" => Some(Self::Configuration),
            "validation" => Some(Self::Validation),
            "upstream" => Some(Self::Upstream),
            "transport" => Some(Self::Transport),
            "invalid_response" => Some(Self::InvalidResponse),
            "resolution_timeout" => Some(Self::ResolutionTimeout),
            "poll_timeout" => Some(Self::PollTimeout),
            "untrackable" => Some(Self::Untrackable),
            "storage" => Some(Self::Storage),
            "remote_outcome" => Some(Self::RemoteOutcome),
            _ => None,
        }
    }
}

/// Error kind and message kept alongside a FAILED status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One slice of a build's append-only log.
///
/// `has_more == false` means no more output was pending at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    #[serde(rename = "chunk")]
    pub text: String,
    pub next_offset: u64,
    pub has_more: bool,
}

/// Live progress of an orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DeployProgress {
    Triggering,
    Queued { queue_id: QueueToken },
    Building { build: BuildInstance },
    Finished { status: DeployStatus },
}

// --- Records ---

/// A deploy attempt for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    pub id: DeployId,
    pub service_id: ServiceId,
    pub git_branch: String,
    pub commit_id: String,
    pub commit_message: String,
    pub status: DeployStatus,
    /// Build number of the CI execution, once known.
    pub build_number: Option<u64>,
    pub failure: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Attributes for a new deploy record; status starts at IN_PROGRESS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDeploy {
    pub service_id: ServiceId,
    pub git_branch: String,
    pub commit_id: String,
    pub commit_message: String,
}

/// The single terminal write an orchestrator run performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalUpdate {
    pub status: DeployStatus,
    pub build_number: Option<u64>,
    pub failure: Option<FailureDetail>,
}

impl TerminalUpdate {
    pub fn succeeded(build_number: u64) -> Self {
        Self {
            status: DeployStatus::Success,
            build_number: Some(build_number),
            failure: None,
        }
    }

    pub fn failed(failure: FailureDetail, build_number: Option<u64>) -> Self {
        Self {
            status: DeployStatus::Failed,
            build_number,
            failure: Some(failure),
        }
    }
}

/// A deployable service owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub user_id: UserId,
    pub name: String,
    pub domain: String,
    pub git_repo: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewService {
    pub user_id: UserId,
    pub name: String,
    pub domain: String,
    pub git_repo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Stored log snapshot for a deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub id: i64,
    pub deploy_id: DeployId,
    pub build_log: Option<String>,
    pub deploy_log: Option<String>,
    pub application_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_outcome_parses_known_results() {
        assert_eq!(RemoteOutcome::from_remote("SUCCESS"), RemoteOutcome::Success);
        assert_eq!(RemoteOutcome::from_remote("NOT_BUILT"), RemoteOutcome::NotBuilt);
        assert_eq!(
            RemoteOutcome::from_remote("CANCELLED"),
            RemoteOutcome::Other("CANCELLED".to_string())
        );
        assert_eq!(RemoteOutcome::from_remote("CANCELLED").as_str(), "CANCELLED");
    }

    #[test]
    fn deploy_status_round_trips_through_str() {
        for status in [
            DeployStatus::InProgress,
            DeployStatus::Success,
            DeployStatus::Failed,
            DeployStatus::Archived,
        ] {
            assert_eq!(DeployStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeployStatus::parse("DONE"), None);
    }

    #[test]
    fn deploy_status_serializes_screaming_case() {
        let json = serde_json::to_string(&DeployStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn log_chunk_uses_wire_field_names() {
        let chunk = LogChunk {
            text: "hello".to_string(),
            next_offset: 5,
            has_more: false,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["chunk"], "hello");
        assert_eq!(value["nextOffset"], 5);
        assert_eq!(value["hasMore"], false);
    }

    #[test]
    fn untrackable_token_is_not_trackable() {
        assert!(!QueueToken::UNTRACKABLE.is_trackable());
        assert!(QueueToken(0).is_trackable());
        assert!(QueueToken(42).is_trackable());
    }

    #[test]
    fn progress_serializes_with_stage_tag() {
        let progress = DeployProgress::Building {
            build: BuildInstance::new("autodeploy", 7),
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["stage"], "building");
        assert_eq!(value["build"]["build_number"], 7);
    }
}
