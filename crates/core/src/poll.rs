use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control_plane::{ControlPlane, DeploymentStatus};
use crate::progress::StatusDisplay;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two polls of an unfinished deployment.
    pub interval: Duration,
    /// Consecutive transport failures tolerated before polling gives up.
    pub max_consecutive_errors: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_consecutive_errors: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }
}

impl PollPolicy {
    /// Delay before retrying after the `failures`-th consecutive failure (1-based).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Succeeded,
    Failed,
}

impl PollState {
    pub fn of(status: &DeploymentStatus) -> Self {
        match (status.done, status.is_failed()) {
            (false, _) => PollState::Polling,
            (true, false) => PollState::Succeeded,
            (true, true) => PollState::Failed,
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct PollOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub display: Option<&'a dyn StatusDisplay>,
}

/// Polls `deployment_id` until the remote reports `done`.
///
/// Transport errors are retried with exponential backoff up to
/// `policy.max_consecutive_errors` in a row; any other error aborts immediately.
/// Returns `Error::Cancelled` as soon as `options.cancel` fires, without issuing
/// another status request.
pub async fn await_completion<C>(
    control: &C,
    deployment_id: &str,
    policy: &PollPolicy,
    options: PollOptions<'_>,
) -> Result<DeploymentStatus>
where
    C: ControlPlane + ?Sized,
{
    let mut failures: u32 = 0;
    let mut polls: u64 = 0;
    loop {
        if options.cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        polls += 1;
        let polled = tokio::select! {
            biased;
            _ = cancelled(options.cancel) => return Err(Error::Cancelled),
            res = control.get_deployment_status(deployment_id) => res,
        };

        let delay = match polled {
            Ok(status) => {
                failures = 0;
                let line = status.stage_line();
                debug!(
                    event = "deploy.poll",
                    deployment_id,
                    polls,
                    done = status.done,
                    status = %status.status,
                    "deploy.poll"
                );
                if let Some(display) = options.display {
                    display.update(&line);
                }
                match PollState::of(&status) {
                    PollState::Polling => policy.interval,
                    PollState::Succeeded => return Ok(status),
                    PollState::Failed => {
                        return Err(Error::RemoteDeployFailure {
                            message: status
                                .error_message
                                .filter(|m| !m.is_empty())
                                .unwrap_or_else(|| "deployment failed".to_string()),
                        });
                    }
                }
            }
            Err(e @ Error::Transport { .. }) => {
                failures += 1;
                if failures >= policy.max_consecutive_errors {
                    warn!(
                        event = "deploy.poll_gave_up",
                        deployment_id,
                        failures,
                        error = %e,
                        "deploy.poll_gave_up"
                    );
                    return Err(e);
                }
                let backoff = policy.backoff_for(failures);
                warn!(
                    event = "deploy.poll_retry",
                    deployment_id,
                    failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "deploy.poll_retry"
                );
                backoff
            }
            Err(e) => return Err(e),
        };

        tokio::select! {
            biased;
            _ = cancelled(options.cancel) => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = PollPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(16));
    }

    #[test]
    fn state_follows_done_and_failure_marker() {
        let mut status = DeploymentStatus::default();
        assert_eq!(PollState::of(&status), PollState::Polling);
        status.done = true;
        status.status = "Succeeded".to_string();
        assert_eq!(PollState::of(&status), PollState::Succeeded);
        status.status = "Failed".to_string();
        assert_eq!(PollState::of(&status), PollState::Failed);
    }
}
