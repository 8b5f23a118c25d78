//! Background reaper task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::SessionManager;

/// Handle to a running reaper. Dropping it leaves the task running until
/// the manager itself is dropped.
pub struct ReaperHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            debug!(error = %e, "Reaper task ended abnormally");
        }
    }
}

impl SessionManager {
    /// Run `reap` every `sessions.reaper_interval`. Requires a Tokio runtime.
    pub fn spawn_reaper(self: &Arc<Self>) -> ReaperHandle {
        let interval = self.config().sessions.reaper_interval();
        spawn_with_interval(Arc::downgrade(self), interval)
    }
}

fn spawn_with_interval(manager: Weak<SessionManager>, interval: Duration) -> ReaperHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        info!(interval_secs = interval.as_secs(), "Session reaper started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.reap().await;
                }
            }
        }
        info!("Session reaper stopped");
    });
    ReaperHandle { cancel, join }
}
