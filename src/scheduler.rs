//! Proactive token renewal ahead of expiry

use crate::auth_client::SessionClient;
use crate::refresher::TokenRefresher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum wait between two consecutive renewals
///
/// Keeps a server that issues tokens shorter than the lead time from being polled
/// in a tight loop.
const MIN_RESCHEDULE: Duration = Duration::from_secs(30);

/// Time to wait before renewing a token expiring at `expires_at`
///
/// Zero when the token is already inside the lead window or expired.
pub fn renewal_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, lead_time: Duration) -> Duration {
    let Ok(lead_time) = chrono::Duration::from_std(lead_time) else {
        return Duration::ZERO;
    };

    (expires_at - now)
        .checked_sub(&lead_time)
        .and_then(|delay| delay.to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Background task renewing the session before its token expires
pub struct RenewalScheduler;

impl RenewalScheduler {
    /// Spawn the renewal task on the current tokio runtime
    ///
    /// `on_failure` runs at most once, when a renewal fails; the task stops after it.
    /// With no stored expiry the task exits without refreshing.
    pub fn start<R, F>(client: Arc<SessionClient<R>>, on_failure: F) -> RenewalHandle
    where
        R: TokenRefresher,
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_renewals(client, on_failure, cancel.clone()));

        RenewalHandle { cancel, task }
    }
}

async fn run_renewals<R, F>(client: Arc<SessionClient<R>>, on_failure: F, cancel: CancellationToken)
where
    R: TokenRefresher,
    F: FnOnce() + Send + 'static,
{
    let renewal = client.config().renewal.clone();
    info!(
        lead_time_secs = renewal.lead_time.as_secs(),
        shared_gate = renewal.share_refresh_gate,
        "Started token renewal task"
    );

    let mut floor = Duration::ZERO;
    loop {
        let Some(expires_at) = client.token_expires_at() else {
            debug!("No stored token expiry, renewal task exiting");
            return;
        };

        let delay = renewal_delay(expires_at, Utc::now(), renewal.lead_time).max(floor);
        if delay.is_zero() {
            debug!(expires_at = %expires_at, "Token inside renewal window, refreshing now");
            if cancel.is_cancelled() {
                return;
            }
        } else {
            debug!(delay_secs = delay.as_secs(), expires_at = %expires_at, "Scheduled token renewal");
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Token renewal cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // The refresh itself is not cancellable
        let result = if renewal.share_refresh_gate {
            client.refresh_session().await
        } else {
            client.refresh_session_ungated().await
        };

        match result {
            Ok(_) => info!("Token renewed ahead of expiry"),
            Err(e) => {
                warn!(error = %e, "Token renewal failed");
                on_failure();
                return;
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        floor = MIN_RESCHEDULE;
    }
}

/// Handle to a running renewal task
pub struct RenewalHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Cancel the pending timer; calling it again has no effect
    ///
    /// A refresh already in flight completes, but nothing is rescheduled.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Token renewal task panicked");
        }
    }
}
