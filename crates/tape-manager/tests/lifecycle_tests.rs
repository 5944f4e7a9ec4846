//! End-to-end lifecycle tests against a live Redis.

use std::sync::Arc;

use tape_manager::{JobStateManager, ManagerConfig, ManagerError, TransitionOutcome};
use tape_models::{CompletionMetadata, JobSpec, JobStatus, OutputFormat, Quality};
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

fn spec() -> JobSpec {
    JobSpec {
        url: "https://www.youtube.com/watch?v=lifecycle".to_string(),
        format: OutputFormat::Mp3,
        quality: Quality::High,
    }
}

async fn cleanup(manager: &JobStateManager, id: &tape_models::JobId) {
    manager.jobs().delete(id).await.ok();
    manager.locks().force_delete(id).await.ok();
}

/// Two racing claims on the same job yield exactly one winner.
#[tokio::test]
#[ignore = "requires Redis"]
async fn concurrent_start_processing_single_winner() {
    let manager = manager();
    let job = manager.create_job(spec()).await.expect("create");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let id = job.id.clone();
        handles.push(tokio::spawn(async move {
            manager.start_processing(&id).await.expect("start")
        }));
    }

    let mut winners = 0;
    let mut tokens = Vec::new();
    for handle in handles {
        let outcome = handle.await.expect("task");
        if outcome.success {
            winners += 1;
            tokens.push(outcome.lock_token.expect("winner carries token"));
        } else {
            assert!(outcome.lock_token.is_none());
        }
    }
    assert_eq!(winners, 1);

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Processing);
    assert_eq!(loaded.lock_id.as_deref(), Some(tokens[0].as_str()));

    cleanup(&manager, &job.id).await;
}

/// Out-of-range progress is a validation error and leaves the stored
/// value untouched.
#[tokio::test]
#[ignore = "requires Redis"]
async fn progress_is_range_validated() {
    let manager = manager();
    let job = manager.create_job(spec()).await.unwrap();
    let claim = manager.start_processing(&job.id).await.unwrap();
    let token = claim.lock_token.expect("claimed");

    let result = manager
        .update_progress(&job.id, 150, None, Some(&token))
        .await;
    assert!(matches!(result, Err(ManagerError::Validation(_))));
    let result = manager
        .update_progress(&job.id, -1, None, Some(&token))
        .await;
    assert!(matches!(result, Err(ManagerError::Validation(_))));

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.progress, 0);

    assert!(manager
        .update_progress(&job.id, 40, Some("transcoding".to_string()), Some(&token))
        .await
        .unwrap());
    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.progress, 40);
    assert_eq!(loaded.current_step.as_deref(), Some("transcoding"));

    cleanup(&manager, &job.id).await;
}

/// A mismatched token is rejected without touching the record.
#[tokio::test]
#[ignore = "requires Redis"]
async fn stale_token_reports_are_rejected() {
    let manager = manager();
    let job = manager.create_job(spec()).await.unwrap();
    let claim = manager.start_processing(&job.id).await.unwrap();
    assert!(claim.success);

    assert!(!manager
        .update_progress(&job.id, 50, None, Some("wrong-token"))
        .await
        .unwrap());
    assert!(!manager
        .complete_job(
            &job.id,
            "https://cdn.example.com/out.mp3",
            CompletionMetadata::default(),
            "wrong-token",
        )
        .await
        .unwrap());
    assert!(manager
        .fail_job(&job.id, "boom", Some("wrong-token"))
        .await
        .unwrap()
        .is_none());

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Processing);
    assert_eq!(loaded.progress, 0);

    cleanup(&manager, &job.id).await;
}

/// Completion stamps the result, releases the lease, and is terminal.
#[tokio::test]
#[ignore = "requires Redis"]
async fn completion_finalizes_job_and_releases_lease() {
    let manager = manager();
    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");

    assert!(manager
        .update_progress(&job.id, 80, None, Some(&token))
        .await
        .unwrap());
    assert!(manager
        .complete_job(
            &job.id,
            "https://cdn.example.com/out.mp3",
            CompletionMetadata {
                file_size_bytes: Some(1024),
                duration_secs: Some(212.5),
                title: Some("Sample".to_string()),
            },
            &token,
        )
        .await
        .unwrap());

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Completed);
    // Progress stays at the last value the worker reported.
    assert_eq!(loaded.progress, 80);
    assert_eq!(
        loaded.download_url.as_deref(),
        Some("https://cdn.example.com/out.mp3")
    );
    assert_eq!(loaded.lock_id, None);
    assert!(!manager.locks().exists(&job.id).await.unwrap());

    // A second completion attempt finds no live lease.
    assert!(!manager
        .complete_job(
            &job.id,
            "https://cdn.example.com/other.mp3",
            CompletionMetadata::default(),
            &token,
        )
        .await
        .unwrap());

    cleanup(&manager, &job.id).await;
}

/// Failure stores the platform-aware user message.
#[tokio::test]
#[ignore = "requires Redis"]
async fn failure_stores_classified_message() {
    let manager = manager();
    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");

    let classification = manager
        .fail_job(&job.id, "ERROR: sign in to confirm your age", Some(&token))
        .await
        .unwrap()
        .expect("failure must apply");
    assert!(!classification.retryable);

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Failed);
    assert!(loaded.error_message.unwrap().contains("YouTube"));
    assert!(!manager.locks().exists(&job.id).await.unwrap());

    cleanup(&manager, &job.id).await;
}

/// The generic transition primitive rejects edges outside the graph.
#[tokio::test]
#[ignore = "requires Redis"]
async fn illegal_edges_are_rejected() {
    let manager = manager();
    let job = manager.create_job(spec()).await.unwrap();

    let outcome = manager
        .transition_job_state(&job.id, JobStatus::Queued, JobStatus::Completed, &[], None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TransitionOutcome::IllegalEdge {
            from: JobStatus::Queued,
            to: JobStatus::Completed,
        }
    );

    // Stale expectation is detected.
    let outcome = manager
        .transition_job_state(&job.id, JobStatus::Processing, JobStatus::Failed, &[], None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TransitionOutcome::StaleState {
            expected: JobStatus::Processing,
            actual: JobStatus::Queued,
        }
    );

    cleanup(&manager, &job.id).await;
}

/// Admin force-reset requeues even a completed job, clearing its result.
#[tokio::test]
#[ignore = "requires Redis"]
async fn force_reset_requeues_completed_job() {
    let manager = manager();
    let job = manager.create_job(spec()).await.unwrap();
    let token = manager
        .start_processing(&job.id)
        .await
        .unwrap()
        .lock_token
        .expect("claimed");
    assert!(manager
        .complete_job(
            &job.id,
            "https://cdn.example.com/out.mp3",
            CompletionMetadata::default(),
            &token,
        )
        .await
        .unwrap());

    let outcome = manager.force_reset(&job.id, "retry").await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let loaded = manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.progress, 0);
    assert_eq!(loaded.download_url, None);
    assert_eq!(loaded.error_message, None);

    cleanup(&manager, &job.id).await;
}
