//! Durable job records over Redis hashes.
//!
//! Each job is one hash under `tape:job:{id}`, indexed by the membership
//! sets `tape:jobs:all` and `tape:jobs:status:{status}`. Status changes
//! go through a Lua compare-and-set so a transition only commits if the
//! stored status still equals what the caller observed. That check is
//! what makes concurrent handlers safe without an exclusive database
//! lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use tape_models::{Job, JobId, JobStatus};

use crate::error::{StoreError, StoreResult};

/// Hash key for a job record.
fn job_key(id: &str) -> String {
    format!("tape:job:{}", id)
}

/// Membership set for one status.
fn status_key(status: JobStatus) -> String {
    format!("tape:jobs:status:{}", status.as_str())
}

/// Membership set of every live job id.
const ALL_JOBS_KEY: &str = "tape:jobs:all";

/// Aggregate counters for average-processing-duration stats.
const PROCESSING_MS_TOTAL_KEY: &str = "tape:stats:processing_ms_total";
const PROCESSING_COUNT_KEY: &str = "tape:stats:processing_count";

/// Timestamp (epoch ms) of the last completed sweep.
const LAST_SWEEP_KEY: &str = "tape:sweep:last_run";

/// Conditional status transition. The update fields are applied and the
/// id is moved between the status index sets only when the stored status
/// matches the expected one. An empty field value clears the field.
const TRANSITION_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'status')
if not cur then
    return {-1, ''}
end
if cur ~= ARGV[1] then
    return {0, cur}
end
for i = 3, #ARGV, 2 do
    if ARGV[i + 1] == '' then
        redis.call('HDEL', KEYS[1], ARGV[i])
    else
        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    end
end
redis.call('SREM', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[2])
return {1, ''}
"#;

/// Field update that refuses to resurrect a deleted job.
const UPDATE_IF_EXISTS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
for i = 1, #ARGV, 2 do
    if ARGV[i + 1] == '' then
        redis.call('HDEL', KEYS[1], ARGV[i])
    else
        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    end
end
return 1
"#;

/// Outcome of a status compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCas {
    /// The transition committed.
    Applied,
    /// The stored status no longer matched the expectation.
    Stale { actual: JobStatus },
    /// The record does not exist (deleted or never created).
    Missing,
}

/// Durable job store client.
pub struct JobStore {
    client: redis::Client,
}

impl JobStore {
    /// Create a new job store.
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Create from the `REDIS_URL` environment variable.
    pub fn from_env() -> StoreResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        Self::new(&url)
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Connectivity probe for readiness checks.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Insert a new job record.
    pub async fn create(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let fields = job_to_fields(job);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(job_key(job.id.as_str()), &fields).ignore();
        pipe.sadd(ALL_JOBS_KEY, job.id.as_str()).ignore();
        pipe.sadd(status_key(job.status), job.id.as_str()).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        info!(job_id = %job.id, platform = %job.platform, "Created job record");
        Ok(())
    }

    /// Fetch a job snapshot. Returns `None` when the record is absent.
    pub async fn get(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(job_key(id.as_str())).await?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_hash(id, &map).map(Some)
    }

    /// Apply field updates only if the record still exists.
    /// An empty value clears the field. Returns `false` when the job is gone.
    pub async fn update_fields(&self, id: &JobId, fields: &[(&str, String)]) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let script = Script::new(UPDATE_IF_EXISTS_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(job_key(id.as_str()));
        for (name, value) in fields {
            invocation.arg(*name).arg(value);
        }
        let applied: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    /// Conditionally transition a job from one status to another,
    /// applying the given field updates atomically with the status move.
    pub async fn transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        fields: &[(&str, String)],
    ) -> StoreResult<StatusCas> {
        let mut conn = self.conn().await?;
        let script = Script::new(TRANSITION_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(job_key(id.as_str()))
            .key(status_key(from))
            .key(status_key(to))
            .arg(from.as_str())
            .arg(id.as_str())
            .arg("status")
            .arg(to.as_str());
        for (name, value) in fields {
            invocation.arg(*name).arg(value);
        }

        let (code, actual): (i32, String) = invocation.invoke_async(&mut conn).await?;
        match code {
            1 => {
                debug!(job_id = %id, from = %from, to = %to, "Transition committed");
                Ok(StatusCas::Applied)
            }
            0 => {
                let actual = actual
                    .parse::<JobStatus>()
                    .map_err(StoreError::corrupt)?;
                Ok(StatusCas::Stale { actual })
            }
            _ => Ok(StatusCas::Missing),
        }
    }

    /// Delete a job record and its index entries.
    pub async fn delete(&self, id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(job_key(id.as_str())).ignore();
        pipe.srem(ALL_JOBS_KEY, id.as_str()).ignore();
        for status in JobStatus::all() {
            pipe.srem(status_key(status), id.as_str()).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        debug!(job_id = %id, "Deleted job record");
        Ok(())
    }

    /// Check whether a job record exists.
    pub async fn exists(&self, id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(job_key(id.as_str())).await?)
    }

    /// Ids of all jobs currently in a status.
    pub async fn ids_by_status(&self, status: JobStatus) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(status_key(status)).await?)
    }

    /// Ids of every live job.
    pub async fn all_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(ALL_JOBS_KEY).await?)
    }

    /// Snapshots of all jobs in a status. Index entries whose record has
    /// already been deleted are skipped.
    pub async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let ids = self.ids_by_status(status).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get(&JobId::from_string(id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Job counts per status (one SCARD per index set).
    pub async fn count_by_status(&self) -> StoreResult<HashMap<JobStatus, u64>> {
        let mut conn = self.conn().await?;
        let mut counts = HashMap::new();
        for status in JobStatus::all() {
            let count: u64 = conn.scard(status_key(status)).await?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Record one completed processing run for duration statistics.
    pub async fn record_processing_duration(&self, millis: u64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.incr(PROCESSING_MS_TOTAL_KEY, millis).ignore();
        pipe.incr(PROCESSING_COUNT_KEY, 1u64).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Average processing duration over all completed jobs, if any.
    pub async fn average_processing_ms(&self) -> StoreResult<Option<f64>> {
        let mut conn = self.conn().await?;
        let total: Option<u64> = conn.get(PROCESSING_MS_TOTAL_KEY).await?;
        let count: Option<u64> = conn.get(PROCESSING_COUNT_KEY).await?;
        match (total, count) {
            (Some(total), Some(count)) if count > 0 => Ok(Some(total as f64 / count as f64)),
            _ => Ok(None),
        }
    }

    /// Stamp the completion of a sweep run.
    pub async fn mark_sweep_run(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(LAST_SWEEP_KEY, Utc::now().timestamp_millis())
            .await?;
        Ok(())
    }

    /// Seconds since the last sweep, if one has run.
    pub async fn seconds_since_last_sweep(&self) -> StoreResult<Option<i64>> {
        let mut conn = self.conn().await?;
        let last: Option<i64> = conn.get(LAST_SWEEP_KEY).await?;
        Ok(last.map(|ms| (Utc::now().timestamp_millis() - ms) / 1000))
    }
}

/// Flatten a job into hash fields. Optional fields are only written when
/// present; `transition`/`update_fields` clear them with empty values.
fn job_to_fields(job: &Job) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".to_string(), job.id.to_string()),
        ("source_url".to_string(), job.source_url.clone()),
        ("platform".to_string(), job.platform.as_str().to_string()),
        ("format".to_string(), job.format.as_str().to_string()),
        ("quality".to_string(), job.quality.as_str().to_string()),
        ("status".to_string(), job.status.as_str().to_string()),
        ("progress".to_string(), job.progress.to_string()),
        ("created_at".to_string(), job.created_at.to_rfc3339()),
        ("updated_at".to_string(), job.updated_at.to_rfc3339()),
        ("expires_at".to_string(), job.expires_at.to_rfc3339()),
    ];

    let mut optional = |name: &str, value: Option<String>| {
        if let Some(value) = value {
            fields.push((name.to_string(), value));
        }
    };
    optional("current_step", job.current_step.clone());
    optional("started_at", job.started_at.map(|t| t.to_rfc3339()));
    optional("completed_at", job.completed_at.map(|t| t.to_rfc3339()));
    optional("download_url", job.download_url.clone());
    optional("file_size_bytes", job.file_size_bytes.map(|v| v.to_string()));
    optional("duration_secs", job.duration_secs.map(|v| v.to_string()));
    optional("title", job.title.clone());
    optional("error_message", job.error_message.clone());
    optional("lock_id", job.lock_id.clone());

    fields
}

/// Rebuild a job from its hash fields.
fn job_from_hash(id: &JobId, map: &HashMap<String, String>) -> StoreResult<Job> {
    fn required<'a>(
        map: &'a HashMap<String, String>,
        id: &JobId,
        name: &str,
    ) -> StoreResult<&'a str> {
        map.get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::corrupt(format!("job {id} missing field {name}")))
    }

    fn timestamp(raw: &str, id: &JobId, name: &str) -> StoreResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::corrupt(format!("job {id} field {name}: {e}")))
    }

    let status = required(map, id, "status")?
        .parse()
        .map_err(StoreError::corrupt)?;
    let progress = required(map, id, "progress")?
        .parse::<u8>()
        .map_err(|e| StoreError::corrupt(format!("job {id} progress: {e}")))?;

    Ok(Job {
        id: id.clone(),
        source_url: required(map, id, "source_url")?.to_string(),
        platform: required(map, id, "platform")?
            .parse()
            .map_err(StoreError::corrupt)?,
        format: required(map, id, "format")?
            .parse()
            .map_err(StoreError::corrupt)?,
        quality: required(map, id, "quality")?
            .parse()
            .map_err(StoreError::corrupt)?,
        status,
        progress,
        current_step: map.get("current_step").cloned(),
        created_at: timestamp(required(map, id, "created_at")?, id, "created_at")?,
        updated_at: timestamp(required(map, id, "updated_at")?, id, "updated_at")?,
        expires_at: timestamp(required(map, id, "expires_at")?, id, "expires_at")?,
        started_at: map
            .get("started_at")
            .map(|raw| timestamp(raw, id, "started_at"))
            .transpose()?,
        completed_at: map
            .get("completed_at")
            .map(|raw| timestamp(raw, id, "completed_at"))
            .transpose()?,
        download_url: map.get("download_url").cloned(),
        file_size_bytes: map
            .get("file_size_bytes")
            .map(|raw| {
                raw.parse()
                    .map_err(|e| StoreError::corrupt(format!("job {id} file_size_bytes: {e}")))
            })
            .transpose()?,
        duration_secs: map
            .get("duration_secs")
            .map(|raw| {
                raw.parse()
                    .map_err(|e| StoreError::corrupt(format!("job {id} duration_secs: {e}")))
            })
            .transpose()?,
        title: map.get("title").cloned(),
        error_message: map.get("error_message").cloned(),
        lock_id: map.get("lock_id").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tape_models::{JobSpec, OutputFormat, Quality};

    fn sample_job() -> Job {
        let mut job = Job::new(
            JobSpec {
                url: "https://www.youtube.com/watch?v=abc".to_string(),
                format: OutputFormat::Mp3,
                quality: Quality::High,
            },
            Duration::hours(24),
        );
        job.current_step = Some("downloading".to_string());
        job.title = Some("Sample".to_string());
        job
    }

    #[test]
    fn hash_round_trip_preserves_all_fields() {
        let job = sample_job();
        let fields = job_to_fields(&job);
        let map: HashMap<String, String> = fields.into_iter().collect();
        let restored = job_from_hash(&job.id, &map).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.source_url, job.source_url);
        assert_eq!(restored.platform, job.platform);
        assert_eq!(restored.format, job.format);
        assert_eq!(restored.quality, job.quality);
        assert_eq!(restored.status, job.status);
        assert_eq!(restored.progress, job.progress);
        assert_eq!(restored.current_step, job.current_step);
        assert_eq!(restored.title, job.title);
        assert_eq!(restored.download_url, None);
        assert_eq!(restored.lock_id, None);
    }

    #[test]
    fn absent_optional_fields_stay_absent() {
        let job = sample_job();
        let fields = job_to_fields(&job);
        assert!(fields.iter().all(|(name, _)| name != "download_url"));
        assert!(fields.iter().all(|(name, _)| name != "lock_id"));
        assert!(fields.iter().all(|(name, _)| name != "error_message"));
    }

    #[test]
    fn corrupt_hash_is_rejected() {
        let job = sample_job();
        let mut map: HashMap<String, String> = job_to_fields(&job).into_iter().collect();
        map.insert("progress".to_string(), "abc".to_string());
        assert!(matches!(
            job_from_hash(&job.id, &map),
            Err(StoreError::CorruptRecord(_))
        ));

        map.remove("progress");
        assert!(matches!(
            job_from_hash(&job.id, &map),
            Err(StoreError::CorruptRecord(_))
        ));
    }
}
