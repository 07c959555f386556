//! Build result polling.

use deploy_core::{BuildInstance, RemoteOutcome};
use tracing::{debug, info};

use crate::ci::{CiApi, CiError, Result};
use crate::polling::{poll_until, PollBudget, Polled};

/// Poll a build until CI reports a result.
///
/// A `null` result means the build is still running. Returns `PollTimeout`
/// when the budget runs out first; the build itself is not cancelled.
pub async fn wait_for_result(
    ci: &dyn CiApi,
    build: &BuildInstance,
    budget: PollBudget,
) -> Result<RemoteOutcome> {
    ci.ensure_configured()?;

    let polled = poll_until(budget, "build result", || async {
        let outcome = ci.build_result(build).await?;
        if outcome.is_none() {
            debug!(build = %build, "build still running");
        }
        Ok::<_, CiError>(outcome)
    })
    .await?;

    match polled {
        Polled::Ready(outcome) => {
            info!(build = %build, result = outcome.as_str(), "build finished");
            Ok(outcome)
        }
        Polled::Exhausted { waited, attempts } => {
            info!(build = %build, attempts, "gave up waiting for build result");
            Err(CiError::PollTimeout {
                build: build.clone(),
                waited,
            })
        }
    }
}
