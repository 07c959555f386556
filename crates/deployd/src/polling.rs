//! Fixed-interval polling with a wall-clock budget.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::ci::CiError;

/// Shortest pause between attempts, whatever the budget says.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout and interval for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollBudget {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Outcome of a polling loop that did not hit a permanent error.
#[derive(Debug)]
pub(crate) enum Polled<T> {
    Ready(T),
    Exhausted { waited: Duration, attempts: u32 },
}

/// Call `attempt` every `budget.interval` until it yields a value or the budget runs out.
///
/// Transient errors are logged and retried; permanent ones end the loop.
pub(crate) async fn poll_until<T, F, Fut>(
    budget: PollBudget,
    what: &str,
    mut attempt: F,
) -> Result<Polled<T>, CiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, CiError>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt().await {
            Ok(Some(value)) => return Ok(Polled::Ready(value)),
            Ok(None) => {}
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                warn!(what, attempt = attempts, error = %e, "poll attempt failed, retrying");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= budget.timeout {
            return Ok(Polled::Exhausted {
                waited: elapsed,
                attempts,
            });
        }

        let remaining = budget.timeout.saturating_sub(elapsed);
        let interval = budget.interval.max(MIN_POLL_INTERVAL);
        tokio::time::sleep(interval.min(remaining)).await;
    }
}
