//! Mapping from CI build results to durable deploy status.

use crate::types::{DeployStatus, RemoteOutcome};

/// Map a remote build outcome onto the deploy status vocabulary.
///
/// `None` means the build has not reported a result yet. Unrecognized results
/// count as failures.
pub fn reconcile(outcome: Option<&RemoteOutcome>) -> DeployStatus {
    match outcome {
        Some(RemoteOutcome::Success) => DeployStatus::Success,
        Some(
            RemoteOutcome::Failure
            | RemoteOutcome::Aborted
            | RemoteOutcome::Unstable
            | RemoteOutcome::NotBuilt
            | RemoteOutcome::Other(_),
        ) => DeployStatus::Failed,
        None => DeployStatus::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(result: Option<&str>) -> DeployStatus {
        let outcome = result.map(RemoteOutcome::from_remote);
        reconcile(outcome.as_ref())
    }

    #[test]
    fn success_maps_to_success() {
        assert_eq!(map(Some("SUCCESS")), DeployStatus::Success);
    }

    #[test]
    fn non_success_results_map_to_failed() {
        for result in ["FAILURE", "ABORTED", "UNSTABLE", "NOT_BUILT", "WEIRD"] {
            assert_eq!(map(Some(result)), DeployStatus::Failed, "{result}");
        }
    }

    #[test]
    fn missing_result_stays_in_progress() {
        assert_eq!(map(None), DeployStatus::InProgress);
    }
}
