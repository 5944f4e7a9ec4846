//! Processing Worker inbound contract.
//!
//! The external worker claims a job here, then reports progress,
//! completion, or failure; every mutating call carries the lock token
//! issued at claim time. A declined claim (`success: false`) means the
//! job is already being handled and is not an error.

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use tape_models::{CompletionMetadata, ErrorClassification, Job, JobId};

use crate::error::{ApiError, ApiResult};
use crate::handlers::convert::is_valid_job_id;
use crate::state::AppState;

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    if !is_valid_job_id(raw) {
        return Err(ApiError::bad_request("Invalid job ID format"));
    }
    Ok(JobId::from_string(raw))
}

/// Claim request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub job_id: String,
}

/// Slice of the job a worker needs to perform the conversion.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub source_url: String,
    pub platform: String,
    pub format: String,
    pub quality: String,
}

impl From<Job> for JobDescriptor {
    fn from(job: Job) -> Self {
        Self {
            source_url: job.source_url,
            platform: job.platform.as_str().to_string(),
            format: job.format.as_str().to_string(),
            quality: job.quality.as_str().to_string(),
        }
    }
}

/// Claim response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobDescriptor>,
}

/// POST /api/worker/start
///
/// Claim a queued job for exclusive processing.
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<StartResponse>> {
    let job_id = parse_job_id(&request.job_id)?;
    let outcome = state.manager.start_processing(&job_id).await?;

    if outcome.success {
        info!(job_id = %job_id, "Worker claimed job");
    }

    Ok(Json(StartResponse {
        success: outcome.success,
        lock_token: outcome.lock_token,
        job: outcome.job.map(JobDescriptor::from),
    }))
}

/// Progress report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    pub job_id: String,
    pub progress: i64,
    #[serde(default)]
    pub current_step: Option<String>,
    pub lock_token: String,
}

/// Generic accepted/rejected response for worker reports.
#[derive(Serialize)]
pub struct AcceptedResponse {
    pub success: bool,
}

/// POST /api/worker/progress
pub async fn report_progress(
    State(state): State<AppState>,
    Json(request): Json<ProgressRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let job_id = parse_job_id(&request.job_id)?;
    let accepted = state
        .manager
        .update_progress(
            &job_id,
            request.progress,
            request.current_step,
            Some(&request.lock_token),
        )
        .await?;
    Ok(Json(AcceptedResponse { success: accepted }))
}

/// Completion report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub job_id: String,
    pub download_url: String,
    #[serde(default)]
    pub metadata: CompletionMetadata,
    pub lock_token: String,
}

/// POST /api/worker/complete
pub async fn report_completion(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let job_id = parse_job_id(&request.job_id)?;
    let accepted = state
        .manager
        .complete_job(
            &job_id,
            &request.download_url,
            request.metadata,
            &request.lock_token,
        )
        .await?;
    Ok(Json(AcceptedResponse { success: accepted }))
}

/// Failure report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRequest {
    pub job_id: String,
    pub reason: String,
    pub lock_token: String,
}

/// Failure response, carrying the classification so the worker can
/// decide whether a retry is worthwhile.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClassification>,
}

/// POST /api/worker/fail
pub async fn report_failure(
    State(state): State<AppState>,
    Json(request): Json<FailureRequest>,
) -> ApiResult<Json<FailureResponse>> {
    let job_id = parse_job_id(&request.job_id)?;
    let classification = state
        .manager
        .fail_job(&job_id, &request.reason, Some(&request.lock_token))
        .await?;
    Ok(Json(FailureResponse {
        success: classification.is_some(),
        classification,
    }))
}

/// Lease extension request for long conversions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    pub job_id: String,
    pub lock_token: String,
    pub additional_secs: u64,
}

/// POST /api/worker/extend
pub async fn extend_lease(
    State(state): State<AppState>,
    Json(request): Json<ExtendRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let job_id = parse_job_id(&request.job_id)?;
    let extended = state
        .manager
        .extend_lock(
            &job_id,
            &request.lock_token,
            Duration::from_secs(request.additional_secs),
        )
        .await?;
    Ok(Json(AcceptedResponse { success: extended }))
}
