//! A2A handler: service tokens for application-to-application calls.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, header},
};
use service_core::error::AppError;
use validator::Validate;

use crate::AppState;
use crate::dtos::admin::ServiceTokenRequest;
use crate::services::ServiceTokenResponse;

/// Request a service token
///
/// Authenticated with the caller's API key as a bearer credential. Denials
/// are specific: an unconfigured source→target pair and an over-broad scope
/// request are distinct failures, never a generic 403.
#[utoipa::path(
    post,
    path = "/a2a/token",
    request_body = ServiceTokenRequest,
    responses(
        (status = 200, description = "Service token issued", body = ServiceTokenResponse),
        (status = 401, description = "Invalid API key"),
        (status = 403, description = "No A2A permission or scopes exceed the allowed set")
    ),
    security(("api_key" = [])),
    tag = "Service Authentication"
)]
pub async fn service_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ServiceTokenRequest>,
) -> Result<Json<ServiceTokenResponse>, AppError> {
    request.validate()?;

    let api_key = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let response = state
        .a2a
        .request_service_token(
            api_key,
            &request.target_client_id,
            &request.scopes,
            request.duration_seconds,
        )
        .await
        .map_err(AppError::from)?;

    Ok(Json(response))
}
