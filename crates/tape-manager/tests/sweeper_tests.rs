//! Recovery sweeper integration tests.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use tape_manager::{JobStateManager, ManagerConfig, RecoverySweeper, SweeperConfig};
use tape_models::{JobId, JobSpec, JobStatus, OutputFormat, Quality};
use tape_store::{JobStore, LockStore, ProgressChannel};

fn manager() -> Arc<JobStateManager> {
    dotenvy::dotenv().ok();
    let jobs = Arc::new(JobStore::from_env().expect("job store"));
    let locks = Arc::new(LockStore::from_env().expect("lock store"));
    let progress = Arc::new(ProgressChannel::from_env().expect("progress channel"));
    Arc::new(JobStateManager::new(
        jobs,
        locks,
        progress,
        ManagerConfig::default(),
    ))
}

fn sweeper(manager: &Arc<JobStateManager>) -> RecoverySweeper {
    // Tiny re-entry interval so test runs never block each other.
    let config = SweeperConfig {
        reentry_interval: StdDuration::from_millis(10),
        ..SweeperConfig::default()
    };
    RecoverySweeper::new(Arc::clone(manager), config)
}

fn spec() -> JobSpec {
    JobSpec {
        url: "https://vimeo.com/987654".to_string(),
        format: OutputFormat::Mp4,
        quality: Quality::Low,
    }
}

async fn cleanup(manager: &JobStateManager, id: &JobId) {
    manager.jobs().delete(id).await.ok();
    manager.locks().force_delete(id).await.ok();
}

/// Make a processing job look abandoned: stale update, no live lease.
async fn strand_job(manager: &JobStateManager, id: &JobId, token: &str, minutes_ago: i64) {
    manager.locks().release(id, token).await.expect("release");
    let stale = (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339();
    manager
        .jobs()
        .update_fields(id, &[("updated_at", stale)])
        .await
        .expect("backdate");
}

/// A stuck job with zero progress goes back to the queue.
#[tokio::test]
#[ignore = "requires Redis"]
async fn stuck_job_without_progress_is_requeued() {
    let manager = manager();
    let sweeper = sweeper(&manager);

    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");
    strand_job(&manager, &job.id, &token, 11).await;

    sweeper.recover_stuck_once().await.unwrap();

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.progress, 0);
    assert_eq!(loaded.error_message, None);
    assert_eq!(loaded.lock_id, None);

    cleanup(&manager, &job.id).await;
}

/// A stuck job with partial progress fails with a timeout message.
#[tokio::test]
#[ignore = "requires Redis"]
async fn stuck_job_with_progress_fails_with_timeout() {
    let manager = manager();
    let sweeper = sweeper(&manager);

    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");
    assert!(manager
        .update_progress(&job.id, 55, None, Some(&token))
        .await
        .unwrap());
    strand_job(&manager, &job.id, &token, 12).await;

    sweeper.recover_stuck_once().await.unwrap();

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Failed);
    assert!(loaded.error_message.unwrap().to_lowercase().contains("timed out"));

    cleanup(&manager, &job.id).await;
}

/// A stale-looking job with a live lease is still being worked; skip it.
#[tokio::test]
#[ignore = "requires Redis"]
async fn live_lease_protects_slow_jobs() {
    let manager = manager();
    let sweeper = sweeper(&manager);

    let job = manager.create_job(spec()).await.unwrap();
    let _token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");
    // Backdate without releasing the lease.
    let stale = (Utc::now() - Duration::minutes(30)).to_rfc3339();
    manager
        .jobs()
        .update_fields(&job.id, &[("updated_at", stale)])
        .await
        .unwrap();

    sweeper.recover_stuck_once().await.unwrap();

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Processing);

    cleanup(&manager, &job.id).await;
}

/// Expired records are deleted on sweep, regardless of status.
#[tokio::test]
#[ignore = "requires Redis"]
async fn expired_jobs_are_deleted() {
    let manager = manager();
    let sweeper = sweeper(&manager);

    let job = manager.create_job(spec()).await.unwrap();
    let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
    manager
        .jobs()
        .update_fields(&job.id, &[("expires_at", past)])
        .await
        .unwrap();

    sweeper.cleanup_once().await.unwrap();
    assert!(manager.get_job(&job.id).await.unwrap().is_none());
}

/// A repeated recovery pass with nothing new to repair reports zeros.
#[tokio::test]
#[ignore = "requires Redis"]
async fn recovery_is_idempotent() {
    let manager = manager();
    let sweeper = sweeper(&manager);

    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");
    strand_job(&manager, &job.id, &token, 15).await;

    sweeper.recover_stuck_once().await.unwrap();
    let after_first = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Queued);

    // A second pass finds nothing to repair for this job.
    sweeper.recover_stuck_once().await.unwrap();
    let after_second = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_second.status, JobStatus::Queued);
    assert_eq!(after_second.error_message, None);
    assert_eq!(after_second.updated_at, after_first.updated_at);

    cleanup(&manager, &job.id).await;
}

/// The full sweep honors the cross-instance re-entry guard.
#[tokio::test]
#[ignore = "requires Redis"]
async fn sweep_respects_reentry_guard() {
    let manager = manager();
    let config = SweeperConfig {
        reentry_interval: StdDuration::from_secs(60),
        ..SweeperConfig::default()
    };
    let sweeper = RecoverySweeper::new(Arc::clone(&manager), config);

    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");
    strand_job(&manager, &job.id, &token, 15).await;

    // Whichever run holds the guard does the repair; the immediate
    // follow-up is skipped and reports nothing.
    let first = sweeper.sweep_once().await.unwrap();
    let second = sweeper.sweep_once().await.unwrap();
    assert!(second.is_empty() || first.is_empty());

    cleanup(&manager, &job.id).await;
}
