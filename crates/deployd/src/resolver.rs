//! Queue resolution.
//!
//! A triggered build waits in the CI admission queue until an executor picks it
//! up. The resolver polls the queue item until it carries a build number.

use deploy_core::{BuildInstance, QueueToken};
use tracing::{debug, info};

use crate::ci::{CiApi, CiError, Result};
use crate::polling::{poll_until, PollBudget, Polled};

/// Wait for a queue item to be scheduled and return the concrete build.
///
/// Fails with `Untrackable` for the sentinel token without contacting CI, and
/// with `ResolutionTimeout` once the budget is spent.
pub async fn resolve_queue_item(
    ci: &dyn CiApi,
    queue_id: QueueToken,
    budget: PollBudget,
) -> Result<BuildInstance> {
    if !queue_id.is_trackable() {
        return Err(CiError::Untrackable);
    }
    ci.ensure_configured()?;

    let polled = poll_until(budget, "queue item", || async {
        let number = ci.queue_item(queue_id).await?;
        if number.is_none() {
            debug!(queue_id = %queue_id, "queue item not scheduled yet");
        }
        Ok::<_, CiError>(number)
    })
    .await?;

    match polled {
        Polled::Ready(number) => {
            let build = BuildInstance::new(ci.job_name(), number);
            info!(queue_id = %queue_id, build = %build, "queue item scheduled");
            Ok(build)
        }
        Polled::Exhausted { waited, attempts } => {
            info!(queue_id = %queue_id, attempts, "queue item was never scheduled");
            Err(CiError::ResolutionTimeout { queue_id, waited })
        }
    }
}
