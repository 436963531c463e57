use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ControlError, Result};

/// How often and how fast a failing loop is restarted.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub delay: Duration,
}

/// Run `task` until `shutdown`, restarting it whenever it fails or returns.
///
/// Restarts are counted over the whole lifetime; once `max_restarts` is used
/// up the last failure becomes [`ControlError::RestartsExhausted`].
pub async fn supervise<F, Fut>(
    name: &str,
    policy: RestartPolicy,
    shutdown: CancellationToken,
    mut task: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut restarts = 0;
    loop {
        let outcome = task().await;
        if shutdown.is_cancelled() {
            info!(task = name, "supervised task stopped");
            return Ok(());
        }
        match outcome {
            Ok(()) => warn!(task = name, "supervised task returned unexpectedly"),
            Err(e) => error!(task = name, error = %e, "supervised task failed"),
        }

        if restarts >= policy.max_restarts {
            return Err(ControlError::RestartsExhausted {
                name: name.to_string(),
                attempts: restarts,
            });
        }
        restarts += 1;
        warn!(task = name, attempt = restarts, delay_ms = policy.delay.as_millis() as u64, "restarting");

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}
