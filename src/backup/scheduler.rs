// mongodumper/src/backup/scheduler.rs
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::logic::BackupPipeline;
use super::s3_upload::ObjectStore;
use crate::errors::Result;

/// Runs the pipeline once (`interval` is `None` or zero) or on every tick until cancelled.
///
/// In one-shot mode the run's error is returned. In periodic mode failed runs are
/// logged and the next tick is the retry; cancellation ends the loop with `Ok`.
pub async fn run_scheduler<S: ObjectStore>(
    pipeline: &BackupPipeline<S>,
    interval: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()> {
    match interval.filter(|d| !d.is_zero()) {
        None => {
            info!("Running one-time backup");
            pipeline.run(cancel).await.into_result().map(|_| ())
        }
        Some(period) => run_periodic(pipeline, period, cancel).await,
    }
}

async fn run_periodic<S: ObjectStore>(
    pipeline: &BackupPipeline<S>,
    period: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(interval = ?period, "Starting scheduled backups");

    // The first tick completes immediately. Ticks missed during a long run are
    // not replayed; the next run starts one period after the late tick.
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut completed_runs = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(completed_runs, "Scheduler stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let result = pipeline.run(cancel).await;
        completed_runs += 1;

        match &result.error {
            Some(err) if err.is_cancelled() => {
                info!(completed_runs, "Scheduler stopped during a backup run");
                return Ok(());
            }
            Some(err) => {
                error!(error = %err, next_attempt_in = ?period, "Scheduled backup failed");
            }
            None => {
                info!(next_run_in = ?period, "Waiting for next scheduled backup");
            }
        }
    }
}
