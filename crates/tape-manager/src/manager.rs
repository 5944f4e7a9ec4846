//! The job lifecycle state machine.
//!
//! Every mutation here goes through one of two guards: a token check
//! against the lock store, or the job store's conditional status
//! compare-and-set. Handler instances share nothing else, so these two
//! guards are what linearize concurrent callers per job. Notification
//! fan-out is always a detached task, so a Pub/Sub outage can never
//! block or roll back a persisted transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use metrics::counter;
use tracing::{info, warn};

use tape_models::{
    classify_error, CompletionMetadata, ErrorClassification, Job, JobId, JobSpec, JobStatus,
    JobValidation,
};
use tape_store::{JobStore, LockStore, ProgressChannel, StatusCas};

use crate::error::{ManagerError, ManagerResult};

/// Default job record retention (24 hours).
const DEFAULT_JOB_TTL_HOURS: i64 = 24;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long job records (and their results) are kept.
    pub retention: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::hours(DEFAULT_JOB_TTL_HOURS),
        }
    }
}

impl ManagerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let hours = std::env::var("JOB_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_JOB_TTL_HOURS);
        Self {
            retention: Duration::hours(hours),
        }
    }
}

/// Result of a `start_processing` attempt. `success == false` means the
/// job is already being handled (or is not startable), an expected
/// outcome of racing callers rather than a failure.
#[derive(Debug, Clone)]
pub struct StartProcessing {
    pub success: bool,
    pub lock_token: Option<String>,
    pub job: Option<Job>,
}

impl StartProcessing {
    fn declined() -> Self {
        Self {
            success: false,
            lock_token: None,
            job: None,
        }
    }
}

/// Structured outcome of a conditional transition. All variants are
/// normal control flow for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition committed.
    Applied,
    /// The requested edge is not in the lifecycle graph.
    IllegalEdge { from: JobStatus, to: JobStatus },
    /// The stored status changed between the caller's read and write.
    StaleState {
        expected: JobStatus,
        actual: JobStatus,
    },
    /// The job record does not exist.
    NotFound,
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Aggregate statistics for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStats {
    /// Job counts keyed by status string
    pub jobs_by_status: HashMap<String, u64>,
    /// Processing jobs that look abandoned (stale update, no live lock)
    pub stuck_jobs: u64,
    /// Live processing leases
    pub live_locks: u64,
    /// Mean wall-clock processing duration over completed jobs
    pub average_processing_ms: Option<f64>,
}

/// Coordinates all job lifecycle mutations through the shared stores.
pub struct JobStateManager {
    jobs: Arc<JobStore>,
    locks: Arc<LockStore>,
    progress: Arc<ProgressChannel>,
    config: ManagerConfig,
}

impl JobStateManager {
    /// Create a new state manager.
    pub fn new(
        jobs: Arc<JobStore>,
        locks: Arc<LockStore>,
        progress: Arc<ProgressChannel>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            jobs,
            locks,
            progress,
            config,
        }
    }

    /// The underlying job store (used by the sweeper and health checks).
    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// The underlying lock store.
    pub fn locks(&self) -> &Arc<LockStore> {
        &self.locks
    }

    /// The progress channel.
    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    /// Insert a new job record (`queued`, progress 0).
    pub async fn create_job(&self, spec: JobSpec) -> ManagerResult<Job> {
        let job = Job::new(spec, self.config.retention);
        self.jobs.create(&job).await?;
        counter!("tape_jobs_created_total").increment(1);
        Ok(job)
    }

    /// Read a job snapshot.
    pub async fn get_job(&self, id: &JobId) -> ManagerResult<Option<Job>> {
        Ok(self.jobs.get(id).await?)
    }

    /// Claim a queued job for processing.
    ///
    /// Acquires the lease first, then commits `queued -> processing`. If
    /// the status race is lost after the lease was granted, the lease is
    /// released again so the winner's claim is undisturbed.
    pub async fn start_processing(&self, id: &JobId) -> ManagerResult<StartProcessing> {
        let Some(job) = self.jobs.get(id).await? else {
            return Err(ManagerError::not_found(id.to_string()));
        };
        if job.status != JobStatus::Queued {
            return Ok(StartProcessing::declined());
        }

        let Some(token) = self.locks.acquire(id).await? else {
            counter!("tape_lock_conflicts_total").increment(1);
            return Ok(StartProcessing::declined());
        };

        let now = Utc::now().to_rfc3339();
        let fields: Vec<(&str, String)> = vec![
            ("updated_at", now.clone()),
            ("started_at", now),
            ("lock_id", token.clone()),
            ("error_message", String::new()),
        ];
        match self
            .jobs
            .transition(id, JobStatus::Queued, JobStatus::Processing, &fields)
            .await?
        {
            StatusCas::Applied => {
                counter!("tape_jobs_started_total").increment(1);
                self.notify_status(id, JobStatus::Processing, job.progress);
                let job = self.jobs.get(id).await?;
                Ok(StartProcessing {
                    success: true,
                    lock_token: Some(token),
                    job,
                })
            }
            StatusCas::Stale { .. } | StatusCas::Missing => {
                // Someone else moved the job between our read and write.
                self.locks.release(id, &token).await?;
                Ok(StartProcessing::declined())
            }
        }
    }

    /// Persist a progress report and fan it out to subscribers.
    ///
    /// Progress must be within [0, 100]; it is deliberately not required
    /// to be monotonic, since a worker may re-report a lower value after
    /// retrying a sub-step. A supplied token must match the live lease.
    pub async fn update_progress(
        &self,
        id: &JobId,
        progress: i64,
        current_step: Option<String>,
        lock_token: Option<&str>,
    ) -> ManagerResult<bool> {
        if !(0..=100).contains(&progress) {
            return Err(ManagerError::validation(format!(
                "progress {progress} out of range [0, 100]"
            )));
        }
        let progress = progress as u8;

        if let Some(token) = lock_token {
            if !self.locks.validate(id, token).await? {
                warn!(job_id = %id, "Progress update with stale lock token rejected");
                return Ok(false);
            }
        }

        let mut fields: Vec<(&str, String)> = vec![
            ("progress", progress.to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        if let Some(step) = &current_step {
            fields.push(("current_step", step.clone()));
        }
        if !self.jobs.update_fields(id, &fields).await? {
            return Ok(false);
        }

        let progress_channel = Arc::clone(&self.progress);
        let job_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = progress_channel
                .progress(&job_id, progress, current_step)
                .await
            {
                warn!(job_id = %job_id, "Progress notification failed: {e}");
            }
        });

        Ok(true)
    }

    /// Finish a job successfully. Valid only from `processing`; requires
    /// the live lock token.
    pub async fn complete_job(
        &self,
        id: &JobId,
        download_url: &str,
        metadata: CompletionMetadata,
        lock_token: &str,
    ) -> ManagerResult<bool> {
        if !self.locks.validate(id, lock_token).await? {
            warn!(job_id = %id, "Completion with stale lock token rejected");
            return Ok(false);
        }
        let Some(job) = self.jobs.get(id).await? else {
            return Ok(false);
        };

        // Progress keeps the last value the worker reported; completion
        // is signaled by the status, not by forcing 100.
        let now = Utc::now();
        let mut fields: Vec<(&str, String)> = vec![
            ("download_url", download_url.to_string()),
            ("completed_at", now.to_rfc3339()),
            ("updated_at", now.to_rfc3339()),
            ("lock_id", String::new()),
            ("current_step", String::new()),
            ("error_message", String::new()),
        ];
        if let Some(size) = metadata.file_size_bytes {
            fields.push(("file_size_bytes", size.to_string()));
        }
        if let Some(duration) = metadata.duration_secs {
            fields.push(("duration_secs", duration.to_string()));
        }
        if let Some(title) = &metadata.title {
            fields.push(("title", title.clone()));
        }

        match self
            .jobs
            .transition(id, JobStatus::Processing, JobStatus::Completed, &fields)
            .await?
        {
            StatusCas::Applied => {
                self.locks.release(id, lock_token).await?;
                if let Some(started) = job.started_at {
                    let elapsed = (now - started).num_milliseconds().max(0) as u64;
                    self.jobs.record_processing_duration(elapsed).await?;
                }
                counter!("tape_jobs_completed_total").increment(1);
                info!(job_id = %id, "Job completed");

                let progress_channel = Arc::clone(&self.progress);
                let job_id = id.clone();
                let url = download_url.to_string();
                tokio::spawn(async move {
                    if let Err(e) = progress_channel.done(&job_id, &url).await {
                        warn!(job_id = %job_id, "Done notification failed: {e}");
                    }
                });
                Ok(true)
            }
            StatusCas::Stale { .. } | StatusCas::Missing => Ok(false),
        }
    }

    /// Mark a job failed. Valid from `queued` or `processing`. The raw
    /// reason is classified per platform into the stored user-facing
    /// message; the classification is returned to the caller. A caller
    /// without the token (admin, sweeper) may omit it.
    pub async fn fail_job(
        &self,
        id: &JobId,
        reason: &str,
        lock_token: Option<&str>,
    ) -> ManagerResult<Option<ErrorClassification>> {
        if let Some(token) = lock_token {
            if !self.locks.validate(id, token).await? {
                warn!(job_id = %id, "Failure report with stale lock token rejected");
                return Ok(None);
            }
        }
        let Some(job) = self.jobs.get(id).await? else {
            return Ok(None);
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
            return Ok(None);
        }

        let classification = classify_error(reason, job.platform);
        let fields: Vec<(&str, String)> = vec![
            ("error_message", classification.user_message.clone()),
            ("updated_at", Utc::now().to_rfc3339()),
            ("lock_id", String::new()),
            ("current_step", String::new()),
        ];

        match self
            .jobs
            .transition(id, job.status, JobStatus::Failed, &fields)
            .await?
        {
            StatusCas::Applied => {
                match lock_token {
                    Some(token) => {
                        self.locks.release(id, token).await?;
                    }
                    None => {
                        self.locks.force_delete(id).await?;
                    }
                }
                counter!("tape_jobs_failed_total").increment(1);
                info!(job_id = %id, platform = %job.platform, kind = ?classification.kind, "Job failed");

                let progress_channel = Arc::clone(&self.progress);
                let job_id = id.clone();
                let message = classification.user_message.clone();
                tokio::spawn(async move {
                    if let Err(e) = progress_channel.error(&job_id, message).await {
                        warn!(job_id = %job_id, "Error notification failed: {e}");
                    }
                });
                Ok(Some(classification))
            }
            StatusCas::Stale { .. } | StatusCas::Missing => Ok(None),
        }
    }

    /// Generic conditional transition along the core lifecycle graph.
    ///
    /// Used by recovery and administrative paths. The edge check and the
    /// stored-status compare-and-set are never bypassed; only lock
    /// ownership is outside this primitive.
    pub async fn transition_job_state(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        extra_fields: &[(&str, String)],
        reason: Option<&str>,
    ) -> ManagerResult<TransitionOutcome> {
        if !from.can_transition_to(to) {
            return Ok(TransitionOutcome::IllegalEdge { from, to });
        }
        self.apply_transition(id, from, to, extra_fields, reason).await
    }

    /// Commit a transition whose edge has already been vetted.
    async fn apply_transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        extra_fields: &[(&str, String)],
        reason: Option<&str>,
    ) -> ManagerResult<TransitionOutcome> {
        let mut fields: Vec<(&str, String)> =
            vec![("updated_at", Utc::now().to_rfc3339())];
        fields.extend(extra_fields.iter().map(|(k, v)| (*k, v.clone())));

        match self.jobs.transition(id, from, to, &fields).await? {
            StatusCas::Applied => {
                info!(
                    job_id = %id,
                    from = %from,
                    to = %to,
                    reason = reason.unwrap_or("-"),
                    "State transition applied"
                );
                Ok(TransitionOutcome::Applied)
            }
            StatusCas::Stale { actual } => Ok(TransitionOutcome::StaleState {
                expected: from,
                actual,
            }),
            StatusCas::Missing => Ok(TransitionOutcome::NotFound),
        }
    }

    /// Force a job to `failed` without a lock token (operator path).
    pub async fn force_fail(&self, id: &JobId, reason: &str) -> ManagerResult<TransitionOutcome> {
        let Some(job) = self.jobs.get(id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
            return Ok(TransitionOutcome::IllegalEdge {
                from: job.status,
                to: JobStatus::Failed,
            });
        }

        let classification = classify_error(reason, job.platform);
        let fields: Vec<(&str, String)> = vec![
            ("error_message", classification.user_message.clone()),
            ("lock_id", String::new()),
            ("current_step", String::new()),
        ];
        // `fail` accepts queued jobs too, so the edge is vetted above
        // rather than by the core graph.
        let outcome = self
            .apply_transition(id, job.status, JobStatus::Failed, &fields, Some(reason))
            .await?;
        if outcome.applied() {
            self.locks.force_delete(id).await?;
            self.notify_error(id, classification.user_message);
        }
        Ok(outcome)
    }

    /// Reset a job back to `queued` without a lock token (operator path).
    ///
    /// Covers the core recovery edges plus the operator-only re-run of a
    /// completed job. Progress and result fields are cleared so the job
    /// looks freshly submitted.
    pub async fn force_reset(&self, id: &JobId, reason: &str) -> ManagerResult<TransitionOutcome> {
        let Some(job) = self.jobs.get(id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if job.status == JobStatus::Queued {
            return Ok(TransitionOutcome::IllegalEdge {
                from: job.status,
                to: JobStatus::Queued,
            });
        }

        let fields: Vec<(&str, String)> = vec![
            ("progress", "0".to_string()),
            ("error_message", String::new()),
            ("download_url", String::new()),
            ("file_size_bytes", String::new()),
            ("duration_secs", String::new()),
            ("current_step", String::new()),
            ("started_at", String::new()),
            ("completed_at", String::new()),
            ("lock_id", String::new()),
        ];
        let outcome = self
            .apply_transition(id, job.status, JobStatus::Queued, &fields, Some(reason))
            .await?;
        if outcome.applied() {
            self.locks.force_delete(id).await?;
            self.notify_status(id, JobStatus::Queued, 0);
        }
        Ok(outcome)
    }

    /// Check a job's invariants without mutating, including lease
    /// liveness against the lock store.
    pub async fn validate_job_state(&self, id: &JobId) -> ManagerResult<Option<JobValidation>> {
        let Some(job) = self.jobs.get(id).await? else {
            return Ok(None);
        };
        let mut report = job.validate();

        if job.status == JobStatus::Processing {
            match (&job.lock_id, self.locks.peek(id).await?) {
                (Some(lock_id), Some(info)) if &info.token == lock_id => {}
                (Some(_), Some(_)) => {
                    report
                        .issues
                        .push("lock_id does not match the live lease".to_string());
                }
                (Some(_), None) => {
                    report
                        .issues
                        .push("processing job has no live lease".to_string());
                }
                (None, _) => {
                    report
                        .issues
                        .push("processing job has no lease reference".to_string());
                }
            }
        }
        report.is_valid = report.issues.is_empty();
        Ok(Some(report))
    }

    /// Extend a lease on behalf of its holder.
    pub async fn extend_lock(
        &self,
        id: &JobId,
        token: &str,
        additional: StdDuration,
    ) -> ManagerResult<bool> {
        Ok(self.locks.extend(id, token, additional).await?)
    }

    /// Release a lease on behalf of its holder. Clears the job record's
    /// lease reference when it still points at the released token.
    pub async fn release_lock(&self, id: &JobId, token: &str) -> ManagerResult<bool> {
        let released = self.locks.release(id, token).await?;
        if released {
            if let Some(job) = self.jobs.get(id).await? {
                if job.lock_id.as_deref() == Some(token) {
                    self.jobs
                        .update_fields(id, &[("lock_id", String::new())])
                        .await?;
                }
            }
        }
        Ok(released)
    }

    /// Aggregate statistics for the admin surface. `stuck_threshold`
    /// matches the sweeper's definition of an abandoned job.
    pub async fn statistics(&self, stuck_threshold: Duration) -> ManagerResult<OrchestratorStats> {
        let counts = self.jobs.count_by_status().await?;
        let jobs_by_status = counts
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        let now = Utc::now();
        let mut stuck = 0u64;
        for job in self.jobs.list_by_status(JobStatus::Processing).await? {
            if job.is_stalled(now, stuck_threshold) && !self.locks.exists(&job.id).await? {
                stuck += 1;
            }
        }

        Ok(OrchestratorStats {
            jobs_by_status,
            stuck_jobs: stuck,
            live_locks: self.locks.live_count().await?,
            average_processing_ms: self.jobs.average_processing_ms().await?,
        })
    }

    fn notify_status(&self, id: &JobId, status: JobStatus, progress: u8) {
        let progress_channel = Arc::clone(&self.progress);
        let job_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = progress_channel.status(&job_id, status, progress).await {
                warn!(job_id = %job_id, "Status notification failed: {e}");
            }
        });
    }

    fn notify_error(&self, id: &JobId, message: String) {
        let progress_channel = Arc::clone(&self.progress);
        let job_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = progress_channel.error(&job_id, message).await {
                warn!(job_id = %job_id, "Error notification failed: {e}");
            }
        });
    }
}
