// Background task for delayed stream cleanup and presence lease expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    hub::{chrono_duration, StreamHub},
    lifecycle::CleanupOutcome,
    metrics,
    presence::ReapReport,
    store::{CleanupJob, CleanupRetry},
};

/// How long a claimed cleanup stays invisible to other sweepers.
const CLAIM_LOCK: Duration = Duration::from_secs(60);
const CLAIM_BATCH: usize = 50;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub cleanups_ended: usize,
    pub cleanups_skipped: usize,
    pub cleanups_failed: usize,
    pub leases: ReapReport,
}

/// Runs [`sweep_once`] every `sweep_interval` until `shutdown` flips to true
/// or its sender is dropped.
pub fn spawn(hub: StreamHub, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(hub.settings().sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();

        info!(interval_secs = hub.settings().sweep_interval.as_secs(), "stream sweeper started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = sweep_once(&hub, Utc::now()).await;
                    if report != SweepReport::default() {
                        debug!(?report, "sweep finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("stream sweeper stopped");
    })
}

/// One pass: claims due cleanup jobs and runs them, then reaps expired
/// presence leases. Failures are logged and counted, never propagated.
pub async fn sweep_once(hub: &StreamHub, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    match hub.store.claim_due_cleanups(now, chrono_duration(CLAIM_LOCK), CLAIM_BATCH).await {
        Ok(jobs) => {
            for job in jobs {
                run_job(hub, &job, now, &mut report).await;
            }
        }
        Err(err) => {
            error!(error = %err, "failed to claim cleanup jobs");
            err.log();
        }
    }

    match hub.reap_expired_leases(now).await {
        Ok(leases) => report.leases = leases,
        Err(err) => {
            error!(error = %err, "failed to reap expired leases");
            err.log();
        }
    }

    report
}

async fn run_job(hub: &StreamHub, job: &CleanupJob, now: DateTime<Utc>, report: &mut SweepReport) {
    let failure = match hub.run_cleanup(job).await {
        Ok(outcome) => {
            match hub.store.complete_cleanup(job.stream_id).await {
                Ok(()) => {
                    debug!(stream_id = %job.stream_id, outcome = outcome.as_str(), "cleanup job done");
                    metrics::record_cleanup_outcome(outcome.as_str());
                    match outcome {
                        CleanupOutcome::Ended => report.cleanups_ended += 1,
                        CleanupOutcome::Skipped => report.cleanups_skipped += 1,
                    }
                    return;
                }
                Err(err) => err,
            }
        }
        Err(err) => err,
    };

    report.cleanups_failed += 1;
    match hub.store.retry_cleanup(job, now, &failure.to_string()).await {
        Ok(CleanupRetry::Rescheduled(due_at)) => {
            warn!(
                stream_id = %job.stream_id,
                attempts = job.attempts,
                next_due_at = %due_at,
                error = %failure,
                "cleanup job failed, rescheduled"
            );
            metrics::record_cleanup_outcome("rescheduled");
        }
        Ok(CleanupRetry::Abandoned) => {
            error!(
                stream_id = %job.stream_id,
                attempts = job.attempts,
                error = %failure,
                "cleanup job abandoned"
            );
            metrics::record_cleanup_outcome("abandoned");
        }
        Err(err) => {
            error!(stream_id = %job.stream_id, error = %err, "failed to reschedule cleanup job");
            err.log();
        }
    }
}
