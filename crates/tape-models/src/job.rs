//! Conversion job records and the lifecycle status graph.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::platform::Platform;

/// Unique identifier for a conversion job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a worker to claim it
    #[default]
    Queued,
    /// Job is actively being processed under a live lock
    Processing,
    /// Job completed successfully
    Completed,
    /// Job failed with an error
    Failed,
}

impl JobStatus {
    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more worker updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Check whether `self -> to` is an edge of the lifecycle graph.
    ///
    /// The graph is closed: queued jobs can only start processing;
    /// processing jobs can finish, fail, or be requeued by recovery;
    /// failed jobs can be requeued for a retry.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Queued)
                | (JobStatus::Failed, JobStatus::Queued)
        )
    }

    /// All statuses, in lifecycle order. Used for index scans and stats.
    pub fn all() -> [JobStatus; 4] {
        [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Requested output container/codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Audio-only extraction
    Mp3,
    /// Full video
    #[default]
    Mp4,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Mp4 => "mp4",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "mp4" => Ok(OutputFormat::Mp4),
            other => Err(format!("unsupported output format: {other}")),
        }
    }
}

/// Output quality selector. The worker maps this onto concrete bitrates
/// or resolutions per format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(format!("unsupported quality: {other}")),
        }
    }
}

/// Parameters accepted at job submission.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Source video URL
    pub url: String,
    /// Requested output format
    pub format: OutputFormat,
    /// Requested quality
    #[serde(default)]
    pub quality: Quality,
}

/// Result metadata reported by the worker on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CompletionMetadata {
    /// Output file size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    /// Media duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Source video title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A tracked conversion job. One durable record per job; this is the
/// source of truth for job existence and terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Source video URL
    pub source_url: String,
    /// Source platform, detected from the URL at submission
    pub platform: Platform,
    /// Requested output format
    pub format: OutputFormat,
    /// Requested quality
    pub quality: Quality,
    /// Lifecycle status
    pub status: JobStatus,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// Current processing step reported by the worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// When the record (and any result) expires and is deleted
    pub expires_at: DateTime<Utc>,
    /// When processing started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When processing finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Download locator for the converted result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Output file size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    /// Media duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Source video title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// User-facing error message (set when failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Token of the live lock, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
}

impl Job {
    /// Create a new queued job from a submission spec.
    pub fn new(spec: JobSpec, retention: Duration) -> Self {
        let now = Utc::now();
        let platform = Platform::detect(&spec.url);
        Self {
            id: JobId::new(),
            source_url: spec.url,
            platform,
            format: spec.format,
            quality: spec.quality,
            status: JobStatus::Queued,
            progress: 0,
            current_step: None,
            created_at: now,
            updated_at: now,
            expires_at: now + retention,
            started_at: None,
            completed_at: None,
            download_url: None,
            file_size_bytes: None,
            duration_secs: None,
            title: None,
            error_message: None,
            lock_id: None,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the record has outlived its retention window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Check whether a processing job has gone quiet for longer than the
    /// stuck threshold. Liveness of its lock is checked separately.
    pub fn is_stalled(&self, now: DateTime<Utc>, stuck_threshold: Duration) -> bool {
        self.status == JobStatus::Processing && now - self.updated_at > stuck_threshold
    }

    /// Check invariants without mutating. Returns every violation found.
    pub fn validate(&self) -> JobValidation {
        let mut issues = Vec::new();

        if self.progress > 100 {
            issues.push(format!("progress {} out of range", self.progress));
        }
        if self.expires_at <= self.created_at {
            issues.push("expires_at is not after created_at".to_string());
        }
        match self.status {
            JobStatus::Completed => {
                if self.download_url.is_none() {
                    issues.push("completed job has no download_url".to_string());
                }
                if self.error_message.is_some() {
                    issues.push("completed job carries an error_message".to_string());
                }
            }
            JobStatus::Failed => {
                if self.error_message.is_none() {
                    issues.push("failed job has no error_message".to_string());
                }
            }
            JobStatus::Queued => {
                if self.error_message.is_some() {
                    issues.push("queued job carries an error_message".to_string());
                }
            }
            JobStatus::Processing => {}
        }
        if self.status != JobStatus::Processing && self.lock_id.is_some() {
            issues.push(format!("{} job still references a lock", self.status));
        }

        JobValidation {
            is_valid: issues.is_empty(),
            issues,
        }
    }
}

/// Outcome of a non-mutating invariant check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(url: &str) -> JobSpec {
        JobSpec {
            url: url.to_string(),
            format: OutputFormat::Mp3,
            quality: Quality::default(),
        }
    }

    #[test]
    fn new_job_is_queued_with_zero_progress() {
        let job = Job::new(spec("https://youtube.com/watch?v=abc"), Duration::hours(24));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.platform, Platform::Youtube);
        assert!(job.expires_at > job.created_at);
        assert!(!job.is_terminal());
    }

    #[test]
    fn legal_transition_graph() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::all() {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("stale".parse::<JobStatus>().is_err());
    }

    #[test]
    fn format_and_quality_parsing() {
        assert_eq!("MP3".parse::<OutputFormat>().unwrap(), OutputFormat::Mp3);
        assert_eq!("mp4".parse::<OutputFormat>().unwrap(), OutputFormat::Mp4);
        assert!("avi".parse::<OutputFormat>().is_err());
        assert_eq!("high".parse::<Quality>().unwrap(), Quality::High);
        assert!("4k".parse::<Quality>().is_err());
    }

    #[test]
    fn validate_flags_inconsistent_records() {
        let mut job = Job::new(spec("https://vimeo.com/123"), Duration::hours(24));
        assert!(job.validate().is_valid);

        job.status = JobStatus::Completed;
        let report = job.validate();
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.contains("download_url")));

        job.download_url = Some("https://cdn.example.com/out.mp3".to_string());
        job.error_message = Some("leftover".to_string());
        let report = job.validate();
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.contains("error_message")));

        job.error_message = None;
        job.lock_id = Some("tok".to_string());
        assert!(!job.validate().is_valid);
    }

    #[test]
    fn stalled_requires_processing_status() {
        let now = Utc::now();
        let mut job = Job::new(spec("https://x.com/u/status/1"), Duration::hours(24));
        job.updated_at = now - Duration::minutes(30);
        assert!(!job.is_stalled(now, Duration::minutes(10)));

        job.status = JobStatus::Processing;
        assert!(job.is_stalled(now, Duration::minutes(10)));
        job.updated_at = now - Duration::minutes(5);
        assert!(!job.is_stalled(now, Duration::minutes(10)));
    }
}
