//! Administrative bearer-token authentication.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Marker extractor for authenticated admin requests.
///
/// Compares the `Authorization: Bearer` value against the operator token
/// from configuration. Admin routes reject everything while no token is
/// configured.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.admin_token.as_deref() else {
            warn!("Admin request rejected: no admin token configured");
            return Err(ApiError::forbidden("Admin surface is disabled"));
        };

        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;

        if token != expected {
            warn!("Admin request rejected: token mismatch");
            return Err(ApiError::unauthorized("Invalid admin token"));
        }

        Ok(AdminAuth)
    }
}
