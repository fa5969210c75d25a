//! In-process trigger for retry passes on a cron schedule.
//!
//! Optional: deployments with an external scheduler call `POST /retry` or the
//! `retry` subcommand instead.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::RetryDriverError;
use crate::retry_driver::RetryDriver;

pub fn parse_schedule(expression: &str) -> Result<Schedule, String> {
    Schedule::from_str(expression).map_err(|e| format!("invalid cron expression '{expression}': {e}"))
}

/// Next fire time strictly after `now`.
pub fn next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

/// Run passes on `schedule` until `shutdown` flips to `true`.
pub async fn run(driver: Arc<RetryDriver>, schedule: Schedule, mut shutdown: watch::Receiver<bool>) {
    loop {
        let now = Utc::now();
        let Some(next) = next_run(&schedule, now) else {
            warn!("retry schedule has no upcoming runs; scheduler stopping");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, "next scheduled retry pass");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("retry scheduler shutting down");
                    return;
                }
                continue;
            }
        }

        match driver.run_pass().await {
            Ok(summary) if summary.timed_out => {
                warn!(scanned = summary.scanned, "scheduled retry pass timed out")
            }
            Ok(_) => {}
            Err(RetryDriverError::AlreadyRunning) => {
                info!("previous retry pass still running; skipping this tick")
            }
            Err(e) => error!(error = %e, "scheduled retry pass aborted"),
        }
    }
}
