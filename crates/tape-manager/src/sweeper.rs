//! Background recovery for stuck jobs, expired records, and orphaned
//! leases.
//!
//! Runs on every API instance; a short guard lease in the lock store
//! enforces the minimum re-entry interval across the whole fleet, so
//! sweeps never overlap. A sweep with nothing to repair reports all
//! zeros; running it twice in a row is harmless.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use tape_models::{classify_error, JobId, JobStatus};

use crate::error::ManagerResult;
use crate::manager::JobStateManager;

/// Interval between sweep runs (5 minutes).
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Minimum re-entry interval across instances (2 minutes).
const DEFAULT_REENTRY_SECS: u64 = 120;

/// Age after which a silent processing job counts as stuck (10 minutes).
const DEFAULT_STUCK_THRESHOLD_SECS: i64 = 600;

/// How many jobs each run samples for invariant validation.
const DEFAULT_VALIDATION_SAMPLE: usize = 25;

/// Name of the cross-instance re-entry guard.
const SWEEP_GUARD: &str = "sweep";

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between runs
    pub interval: StdDuration,
    /// Minimum time between runs across all instances
    pub reentry_interval: StdDuration,
    /// Quiet time after which a processing job counts as stuck
    pub stuck_threshold: Duration,
    /// Max jobs validated per run
    pub validation_sample: usize,
    /// Master switch (`ENABLE_SWEEPER`)
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            reentry_interval: StdDuration::from_secs(DEFAULT_REENTRY_SECS),
            stuck_threshold: Duration::seconds(DEFAULT_STUCK_THRESHOLD_SECS),
            validation_sample: DEFAULT_VALIDATION_SAMPLE,
            enabled: true,
        }
    }
}

impl SweeperConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            interval: StdDuration::from_secs(
                std::env::var("SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            reentry_interval: StdDuration::from_secs(
                std::env::var("SWEEP_REENTRY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_REENTRY_SECS),
            ),
            stuck_threshold: Duration::seconds(
                std::env::var("STUCK_THRESHOLD_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_STUCK_THRESHOLD_SECS),
            ),
            validation_sample: std::env::var("SWEEP_VALIDATION_SAMPLE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_VALIDATION_SAMPLE),
            enabled: std::env::var("ENABLE_SWEEPER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        }
    }
}

/// Counts of repairs performed by one sweep run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Stuck jobs with no progress, returned to the queue
    pub requeued: u32,
    /// Stuck jobs with partial progress, failed with a timeout message
    pub failed_timeouts: u32,
    /// Expired job records deleted
    pub deleted_expired: u32,
    /// Orphaned or malformed lease records removed
    pub cleared_locks: u32,
    /// Invariant violations auto-corrected
    pub validation_fixes: u32,
}

impl SweepReport {
    /// True when the run had nothing to repair.
    pub fn is_empty(&self) -> bool {
        self.requeued == 0
            && self.failed_timeouts == 0
            && self.deleted_expired == 0
            && self.cleared_locks == 0
            && self.validation_fixes == 0
    }
}

/// Periodic stuck-job detector and store janitor.
pub struct RecoverySweeper {
    manager: Arc<JobStateManager>,
    config: SweeperConfig,
}

impl RecoverySweeper {
    /// Create a new sweeper.
    pub fn new(manager: Arc<JobStateManager>, config: SweeperConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run the detection loop indefinitely. Spawn as a background task.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Recovery sweeper is disabled");
            return;
        }

        info!(interval = ?self.config.interval, "Starting recovery sweeper");
        let mut ticker = interval(self.config.interval);

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        requeued = report.requeued,
                        failed_timeouts = report.failed_timeouts,
                        deleted_expired = report.deleted_expired,
                        cleared_locks = report.cleared_locks,
                        validation_fixes = report.validation_fixes,
                        "Sweep complete"
                    );
                }
                Ok(_) => debug!("Sweep complete, nothing to repair"),
                Err(e) => error!("Sweep failed: {e}"),
            }
        }
    }

    /// Run a single sweep. Returns an all-zero report when another
    /// instance swept within the re-entry interval.
    pub async fn sweep_once(&self) -> ManagerResult<SweepReport> {
        let locks = self.manager.locks();
        if !locks
            .acquire_guard(SWEEP_GUARD, self.config.reentry_interval)
            .await?
        {
            debug!("Skipping sweep, another instance swept recently");
            return Ok(SweepReport::default());
        }

        counter!("tape_sweeps_total").increment(1);

        let mut report = SweepReport::default();
        self.recover_stuck_jobs(&mut report).await?;
        self.purge_expired(&mut report).await?;
        self.cleanup_locks(&mut report).await?;
        self.validate_sample(&mut report).await?;

        self.manager.jobs().mark_sweep_run().await?;
        Ok(report)
    }

    /// Run only the stuck-job pass (admin `recover-stuck`).
    pub async fn recover_stuck_once(&self) -> ManagerResult<SweepReport> {
        let mut report = SweepReport::default();
        self.recover_stuck_jobs(&mut report).await?;
        Ok(report)
    }

    /// Run only the janitorial passes (admin `cleanup`).
    pub async fn cleanup_once(&self) -> ManagerResult<SweepReport> {
        let mut report = SweepReport::default();
        self.purge_expired(&mut report).await?;
        self.cleanup_locks(&mut report).await?;
        Ok(report)
    }

    /// Requeue or fail processing jobs that went quiet with no live
    /// lease. A job with a live lease is still being worked and is
    /// skipped regardless of its age.
    async fn recover_stuck_jobs(&self, report: &mut SweepReport) -> ManagerResult<()> {
        let jobs = self.manager.jobs();
        let locks = self.manager.locks();
        let now = Utc::now();

        for job in jobs.list_by_status(JobStatus::Processing).await? {
            if !job.is_stalled(now, self.config.stuck_threshold) {
                continue;
            }
            if locks.exists(&job.id).await? {
                continue;
            }

            warn!(
                job_id = %job.id,
                progress = job.progress,
                updated_at = %job.updated_at,
                "Detected stuck job"
            );

            if job.progress == 0 {
                // Nothing was produced; a retry is free.
                let fields: Vec<(&str, String)> = vec![
                    ("error_message", String::new()),
                    ("lock_id", String::new()),
                    ("current_step", String::new()),
                    ("started_at", String::new()),
                ];
                let outcome = self
                    .manager
                    .transition_job_state(
                        &job.id,
                        JobStatus::Processing,
                        JobStatus::Queued,
                        &fields,
                        Some("stuck job requeued"),
                    )
                    .await?;
                if outcome.applied() {
                    report.requeued += 1;
                    counter!("tape_jobs_requeued_total").increment(1);
                    self.notify_status(&job.id, JobStatus::Queued, 0).await;
                }
            } else {
                // Partial work is not resumable without the worker.
                let message = classify_error("processing timed out", job.platform).user_message;
                let fields: Vec<(&str, String)> = vec![
                    ("error_message", message.clone()),
                    ("lock_id", String::new()),
                    ("current_step", String::new()),
                ];
                let outcome = self
                    .manager
                    .transition_job_state(
                        &job.id,
                        JobStatus::Processing,
                        JobStatus::Failed,
                        &fields,
                        Some("stuck job timed out"),
                    )
                    .await?;
                if outcome.applied() {
                    report.failed_timeouts += 1;
                    counter!("tape_jobs_timed_out_total").increment(1);
                    self.manager.progress().error(&job.id, message).await.ok();
                }
            }
        }
        Ok(())
    }

    /// Delete every job whose retention window has passed, regardless of
    /// status, along with any lease it still holds. Dangling index
    /// entries for already-deleted records are cleaned as a side effect.
    async fn purge_expired(&self, report: &mut SweepReport) -> ManagerResult<()> {
        let jobs = self.manager.jobs();
        let locks = self.manager.locks();
        let now = Utc::now();

        for id in jobs.all_ids().await? {
            let id = JobId::from_string(id);
            match jobs.get(&id).await? {
                Some(job) if job.is_expired(now) => {
                    jobs.delete(&id).await?;
                    locks.force_delete(&id).await?;
                    report.deleted_expired += 1;
                    debug!(job_id = %id, "Deleted expired job");
                }
                Some(_) => {}
                None => {
                    jobs.delete(&id).await?;
                }
            }
        }
        Ok(())
    }

    /// Remove lease records that self-expiry cannot reap: keys written
    /// without a TTL, and leases whose job record is gone.
    async fn cleanup_locks(&self, report: &mut SweepReport) -> ManagerResult<()> {
        let jobs = self.manager.jobs();
        let locks = self.manager.locks();

        for id in locks.scan_job_ids().await? {
            let id = JobId::from_string(id);
            let malformed = matches!(locks.remaining_ttl_ms(&id).await?, Some(ttl) if ttl < 0);
            let orphaned = !malformed && !jobs.exists(&id).await?;
            if malformed || orphaned {
                if locks.force_delete(&id).await? {
                    report.cleared_locks += 1;
                    debug!(job_id = %id, malformed, "Cleared lease record");
                }
            }
        }
        Ok(())
    }

    /// Validate a bounded sample of jobs and auto-correct the simple
    /// inconsistencies; anything else is only logged.
    async fn validate_sample(&self, report: &mut SweepReport) -> ManagerResult<()> {
        let jobs = self.manager.jobs();
        let locks = self.manager.locks();

        let mut ids = jobs.all_ids().await?;
        ids.truncate(self.config.validation_sample);

        for id in ids {
            let id = JobId::from_string(id);
            let Some(job) = jobs.get(&id).await? else {
                continue;
            };
            let validation = job.validate();
            if validation.is_valid {
                continue;
            }

            if job.status == JobStatus::Completed && job.error_message.is_some() {
                if jobs
                    .update_fields(&id, &[("error_message", String::new())])
                    .await?
                {
                    report.validation_fixes += 1;
                }
            }
            if job.status != JobStatus::Processing
                && job.lock_id.is_some()
                && !locks.exists(&id).await?
            {
                if jobs
                    .update_fields(&id, &[("lock_id", String::new())])
                    .await?
                {
                    report.validation_fixes += 1;
                }
            }

            for issue in &validation.issues {
                warn!(job_id = %id, issue = issue.as_str(), "Job invariant violation");
            }
        }
        Ok(())
    }

    async fn notify_status(&self, id: &JobId, status: JobStatus, progress: u8) {
        if let Err(e) = self.manager.progress().status(id, status, progress).await {
            warn!(job_id = %id, "Sweeper notification failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_all_zero() {
        let report = SweepReport::default();
        assert!(report.is_empty());

        let report = SweepReport {
            requeued: 1,
            ..Default::default()
        };
        assert!(!report.is_empty());
    }

    #[test]
    fn default_config_matches_operational_defaults() {
        let config = SweeperConfig::default();
        assert_eq!(config.interval, StdDuration::from_secs(300));
        assert_eq!(config.reentry_interval, StdDuration::from_secs(120));
        assert_eq!(config.stuck_threshold, Duration::seconds(600));
        assert!(config.enabled);
    }
}
