//! Administrative control plane.
//!
//! Forced operations bypass lock ownership only; the legal-edge and
//! stored-status checks run exactly as they do for regular callers.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use tape_manager::{OrchestratorStats, SweepReport, TransitionOutcome};
use tape_models::{JobId, JobValidation};

use crate::auth::AdminAuth;
use crate::error::{ApiError, ApiResult};
use crate::handlers::convert::is_valid_job_id;
use crate::state::AppState;

/// Envelope for every admin response.
#[derive(Serialize)]
pub struct AdminResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> AdminResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn rejected(error: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(error.into()),
        })
    }
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    if !is_valid_job_id(raw) {
        return Err(ApiError::bad_request("Invalid job ID format"));
    }
    Ok(JobId::from_string(raw))
}

/// Render a transition outcome into the admin envelope.
fn transition_response(outcome: TransitionOutcome, applied_message: &str) -> Json<AdminResponse<String>> {
    match outcome {
        TransitionOutcome::Applied => AdminResponse::ok(applied_message.to_string()),
        TransitionOutcome::IllegalEdge { from, to } => {
            AdminResponse::rejected(format!("transition {from} -> {to} is not legal"))
        }
        TransitionOutcome::StaleState { expected, actual } => AdminResponse::rejected(format!(
            "job changed underneath the request (expected {expected}, found {actual})"
        )),
        TransitionOutcome::NotFound => AdminResponse::rejected("job not found"),
    }
}

/// Statistics payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    #[serde(flatten)]
    pub stats: OrchestratorStats,
    pub active_subscribers: usize,
}

/// GET /api/admin/stats
pub async fn get_stats(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<AdminResponse<AdminStats>>> {
    let stats = state
        .manager
        .statistics(state.sweeper.config().stuck_threshold)
        .await?;
    let active_subscribers = state.subscribers.total().await;

    Ok(AdminResponse::ok(AdminStats {
        stats,
        active_subscribers,
    }))
}

/// Health payload: store reachability and sweep recency.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminHealth {
    pub job_store_ok: bool,
    pub lock_store_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_sweep: Option<i64>,
}

/// GET /api/admin/health
pub async fn get_health(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<AdminResponse<AdminHealth>>> {
    let job_store_ok = state.manager.jobs().ping().await.is_ok();
    let lock_store_ok = state.manager.locks().ping().await.is_ok();
    let seconds_since_last_sweep = if job_store_ok {
        state.manager.jobs().seconds_since_last_sweep().await?
    } else {
        None
    };

    Ok(AdminResponse::ok(AdminHealth {
        job_store_ok,
        lock_store_ok,
        seconds_since_last_sweep,
    }))
}

/// GET|POST /api/admin/cleanup
///
/// Purge expired records and orphaned lease entries.
pub async fn cleanup(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<AdminResponse<SweepReport>>> {
    let report = state.sweeper.cleanup_once().await?;
    info!(deleted = report.deleted_expired, cleared = report.cleared_locks, "Admin cleanup");
    Ok(AdminResponse::ok(report))
}

/// POST /api/admin/recover-stuck
pub async fn recover_stuck(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<AdminResponse<SweepReport>>> {
    let report = state.sweeper.recover_stuck_once().await?;
    info!(
        requeued = report.requeued,
        failed = report.failed_timeouts,
        "Admin stuck-job recovery"
    );
    Ok(AdminResponse::ok(report))
}

/// Query for job validation.
#[derive(Debug, Deserialize)]
pub struct ValidateJobQuery {
    #[serde(rename = "jobId", alias = "job_id")]
    pub job_id: String,
}

/// GET /api/admin/validate-job?jobId=
pub async fn validate_job(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Query(query): Query<ValidateJobQuery>,
) -> ApiResult<Json<AdminResponse<JobValidation>>> {
    let job_id = parse_job_id(&query.job_id)?;
    let validation = state
        .manager
        .validate_job_state(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(AdminResponse::ok(validation))
}

/// Forced-operation request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceRequest {
    pub job_id: String,
    pub reason: String,
}

/// POST /api/admin/force-fail
pub async fn force_fail(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<ForceRequest>,
) -> ApiResult<Json<AdminResponse<String>>> {
    let job_id = parse_job_id(&request.job_id)?;
    let outcome = state.manager.force_fail(&job_id, &request.reason).await?;
    info!(job_id = %job_id, reason = request.reason.as_str(), ?outcome, "Admin force-fail");
    Ok(transition_response(outcome, "job failed"))
}

/// POST /api/admin/force-reset
pub async fn force_reset(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<ForceRequest>,
) -> ApiResult<Json<AdminResponse<String>>> {
    let job_id = parse_job_id(&request.job_id)?;
    let outcome = state.manager.force_reset(&job_id, &request.reason).await?;
    info!(job_id = %job_id, reason = request.reason.as_str(), ?outcome, "Admin force-reset");
    Ok(transition_response(outcome, "job requeued"))
}

/// Lock extension request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendLockRequest {
    pub job_id: String,
    pub lock_id: String,
    #[serde(rename = "additionalTime")]
    pub additional_secs: u64,
}

/// POST /api/admin/extend-lock
pub async fn extend_lock(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<ExtendLockRequest>,
) -> ApiResult<Json<AdminResponse<String>>> {
    let job_id = parse_job_id(&request.job_id)?;
    let extended = state
        .manager
        .extend_lock(
            &job_id,
            &request.lock_id,
            Duration::from_secs(request.additional_secs),
        )
        .await?;
    if extended {
        Ok(AdminResponse::ok("lock extended".to_string()))
    } else {
        Ok(AdminResponse::rejected("lock missing or token mismatch"))
    }
}

/// Lock release request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLockRequest {
    pub job_id: String,
    pub lock_id: String,
}

/// POST /api/admin/release-lock
pub async fn release_lock(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<ReleaseLockRequest>,
) -> ApiResult<Json<AdminResponse<String>>> {
    let job_id = parse_job_id(&request.job_id)?;
    let released = state.manager.release_lock(&job_id, &request.lock_id).await?;
    if released {
        info!(job_id = %job_id, "Admin released lock");
        Ok(AdminResponse::ok("lock released".to_string()))
    } else {
        Ok(AdminResponse::rejected("lock missing or token mismatch"))
    }
}
