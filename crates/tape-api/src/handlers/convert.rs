//! Job submission and status polling.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use tape_models::{JobId, JobSpec, OutputFormat, Quality};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Conversion request from the front end.
#[derive(Debug, Deserialize, Validate)]
pub struct ConvertRequest {
    /// Source video URL
    #[validate(url(message = "must be a valid URL"))]
    pub url: String,
    /// Output format: "mp3" or "mp4"
    pub format: String,
    /// Quality selector: "low", "medium", or "high"
    #[serde(default)]
    pub quality: Option<String>,
}

/// Conversion response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResponse {
    pub job_id: String,
    pub status: String,
    pub progress: u8,
    pub platform: String,
}

/// POST /api/convert
///
/// Accept a conversion job and insert the queued record. The Processing
/// Worker claims queued jobs separately through the worker surface.
pub async fn convert(
    State(state): State<AppState>,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Json<ConvertResponse>> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let format: OutputFormat = request
        .format
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let quality: Quality = match request.quality.as_deref() {
        Some(raw) => raw.parse().map_err(|e: String| ApiError::bad_request(e))?,
        None => Quality::default(),
    };

    let job = state
        .manager
        .create_job(JobSpec {
            url: request.url,
            format,
            quality,
        })
        .await?;

    info!(job_id = %job.id, platform = %job.platform, format = %job.format, "Accepted conversion job");

    Ok(Json(ConvertResponse {
        job_id: job.id.to_string(),
        status: job.status.as_str().to_string(),
        progress: job.progress,
        platform: job.platform.as_str().to_string(),
    }))
}

/// Job status snapshot. The durable fallback when push notifications
/// are unavailable.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress: u8,
    pub platform: String,
    pub format: String,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: String,
}

/// GET /status/:job_id
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    if !is_valid_job_id(&job_id) {
        return Err(ApiError::bad_request("Invalid job ID format"));
    }

    let job = state
        .manager
        .get_job(&JobId::from_string(job_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    Ok(Json(JobStatusResponse {
        job_id: job.id.to_string(),
        status: job.status.as_str().to_string(),
        progress: job.progress,
        platform: job.platform.as_str().to_string(),
        format: job.format.as_str().to_string(),
        quality: job.quality.as_str().to_string(),
        current_step: job.current_step,
        download_url: job.download_url,
        error_message: job.error_message,
        title: job.title,
        created_at: job.created_at.to_rfc3339(),
        updated_at: job.updated_at.to_rfc3339(),
        expires_at: job.expires_at.to_rfc3339(),
    }))
}

/// Validate job ID format to prevent injection into store keys.
///
/// Valid format: alphanumeric characters and hyphens only, 8-64 chars.
pub fn is_valid_job_id(id: &str) -> bool {
    if id.len() < 8 || id.len() > 64 {
        return false;
    }
    id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_job_ids() {
        assert!(is_valid_job_id("12345678"));
        assert!(is_valid_job_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_valid_job_id("abc-1234-def"));
    }

    #[test]
    fn test_invalid_job_ids() {
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("short"));
        assert!(!is_valid_job_id("has space8"));
        assert!(!is_valid_job_id("has_underscore"));
        assert!(!is_valid_job_id(&"a".repeat(65)));
    }
}
