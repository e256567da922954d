use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::orchestrator::SessionOrchestrator;
use crate::domains::environments::EnvironmentStatus;
use crate::errors::CoreResult;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose agent exited on its own and were marked completed.
    pub exited: Vec<String>,
    pub idle_stopped: Vec<String>,
}

/// Periodically reconciles recorded session state with the sandboxes:
/// agents that exited are completed, idle sessions are stopped.
pub struct ActivityMonitor {
    orchestrator: Arc<SessionOrchestrator>,
    idle_timeout_minutes: u64,
}

impl ActivityMonitor {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, idle_timeout_minutes: u64) -> Self {
        Self {
            orchestrator,
            idle_timeout_minutes,
        }
    }

    /// Sweeps every `period` until `shutdown` flips to true.
    pub async fn start_polling(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Failed to update session activity: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Activity monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> CoreResult<SweepReport> {
        let mut report = SweepReport::default();

        for session in self.orchestrator.list_sessions(None)? {
            if !session.status.is_active() {
                continue;
            }
            match self.orchestrator.get_status(&session.id).await {
                Ok(EnvironmentStatus::Stopped) => {
                    info!("Agent of session '{}' exited", session.name);
                    match self.orchestrator.complete(&session.id).await {
                        Ok(_) => report.exited.push(session.id),
                        Err(e) => error!("Failed to complete session '{}': {e}", session.name),
                    }
                }
                // Unreachable sandboxes are left alone until they answer again
                Ok(_) => {}
                Err(e) => debug!("Status of session '{}' unavailable: {e}", session.name),
            }
        }

        report.idle_stopped = self
            .orchestrator
            .stop_idle_sessions(self.idle_timeout_minutes)
            .await?;
        Ok(report)
    }
}
