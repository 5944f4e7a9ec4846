//! Job store integration tests.

use chrono::Duration;

use tape_models::{Job, JobSpec, JobStatus, OutputFormat, Quality};
use tape_store::{JobStore, StatusCas};

fn job_store() -> JobStore {
    dotenvy::dotenv().ok();
    JobStore::from_env().expect("Failed to create job store")
}

fn sample_job() -> Job {
    Job::new(
        JobSpec {
            url: "https://www.youtube.com/watch?v=integration".to_string(),
            format: OutputFormat::Mp4,
            quality: Quality::Medium,
        },
        Duration::hours(1),
    )
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn create_and_read_back() {
    let store = job_store();
    let job = sample_job();

    store.create(&job).await.expect("create failed");

    let loaded = store
        .get(&job.id)
        .await
        .expect("get failed")
        .expect("job must exist");
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.progress, 0);
    assert_eq!(loaded.source_url, job.source_url);

    let ids = store.ids_by_status(JobStatus::Queued).await.unwrap();
    assert!(ids.contains(&job.id.to_string()));

    store.delete(&job.id).await.unwrap();
    assert!(store.get(&job.id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn transition_is_conditional_on_stored_status() {
    let store = job_store();
    let job = sample_job();
    store.create(&job).await.unwrap();

    let outcome = store
        .transition(&job.id, JobStatus::Queued, JobStatus::Processing, &[])
        .await
        .unwrap();
    assert_eq!(outcome, StatusCas::Applied);

    // The same expectation no longer holds.
    let outcome = store
        .transition(&job.id, JobStatus::Queued, JobStatus::Processing, &[])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StatusCas::Stale {
            actual: JobStatus::Processing
        }
    );

    // Index sets follow the committed transition.
    let processing = store.ids_by_status(JobStatus::Processing).await.unwrap();
    assert!(processing.contains(&job.id.to_string()));
    let queued = store.ids_by_status(JobStatus::Queued).await.unwrap();
    assert!(!queued.contains(&job.id.to_string()));

    store.delete(&job.id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn transition_on_missing_job_reports_missing() {
    let store = job_store();
    let job = sample_job();

    let outcome = store
        .transition(&job.id, JobStatus::Queued, JobStatus::Processing, &[])
        .await
        .unwrap();
    assert_eq!(outcome, StatusCas::Missing);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn update_fields_refuses_missing_jobs_and_clears_fields() {
    let store = job_store();
    let job = sample_job();

    assert!(!store
        .update_fields(&job.id, &[("progress", "10".to_string())])
        .await
        .unwrap());

    store.create(&job).await.unwrap();
    assert!(store
        .update_fields(
            &job.id,
            &[
                ("progress", "10".to_string()),
                ("current_step", "downloading".to_string()),
            ],
        )
        .await
        .unwrap());

    let loaded = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.progress, 10);
    assert_eq!(loaded.current_step.as_deref(), Some("downloading"));

    // Empty value clears the field.
    assert!(store
        .update_fields(&job.id, &[("current_step", String::new())])
        .await
        .unwrap());
    let loaded = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.current_step, None);

    store.delete(&job.id).await.unwrap();
}
