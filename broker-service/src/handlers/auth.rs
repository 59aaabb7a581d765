//! Auth handlers: login initiation, code exchange, refresh, validation,
//! revocation.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Redirect,
};
use service_core::error::AppError;
use validator::Validate;

use crate::AppState;
use crate::dtos::auth::{
    LoginParams, RefreshRequest, RevokeRequest, TokenRequest, ValidateRequest, ValidateResponse,
};
use crate::models::Application;
use crate::services::TokenResponse;
use crate::services::error::BrokerError;

/// Initiate login
///
/// Redirects the browser to the identity provider with client_id,
/// redirect_uri, and state.
#[utoipa::path(
    get,
    path = "/auth/login",
    params(
        ("client_id" = String, Query, description = "Target application"),
        ("redirect_uri" = String, Query, description = "Return URI after login"),
        ("state" = Option<String>, Query, description = "Opaque CSRF state")
    ),
    responses(
        (status = 307, description = "Redirect to the identity provider"),
        (status = 400, description = "Unknown application or unregistered redirect URI")
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Result<Redirect, AppError> {
    let app = active_application(&state, &params.client_id).await?;
    check_redirect_uri(&app, &params.redirect_uri)?;

    let url = state.idp.authorize_url(
        &params.client_id,
        &params.redirect_uri,
        params.state.as_deref().unwrap_or(""),
    );
    Ok(Redirect::temporary(&url))
}

/// Exchange an authorization code for tokens
#[utoipa::path(
    post,
    path = "/auth/token",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Token pair issued", body = TokenResponse),
        (status = 400, description = "Bad grant type or redirect URI"),
        (status = 401, description = "Code rejected by the identity provider")
    ),
    tag = "Authentication"
)]
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    request.validate()?;
    if request.grant_type != "authorization_code" {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "unsupported grant_type: {}",
            request.grant_type
        )));
    }

    let app = active_application(&state, &request.client_id).await?;
    check_redirect_uri(&app, &request.redirect_uri)?;

    let principal = state
        .idp
        .exchange_code(&request.code, &request.redirect_uri)
        .await
        .map_err(AppError::from)?;

    let resolved = state
        .resolver
        .resolve(&principal.groups, &app.client_id)
        .await
        .map_err(AppError::from)?;

    let ip = client_ip(&headers);
    let tokens = state
        .tokens
        .issue_user_tokens(
            &principal,
            &app,
            &resolved,
            ip.as_deref(),
            request.device.as_deref(),
        )
        .await
        .map_err(AppError::from)?;

    Ok(Json(tokens))
}

/// Rotate a refresh token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair issued", body = TokenResponse),
        (status = 401, description = "Invalid, expired, revoked, or replayed refresh token")
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    request.validate()?;
    let ip = client_ip(&headers);
    let tokens = state
        .tokens
        .refresh(&request.refresh_token, &state.resolver, ip.as_deref())
        .await
        .map_err(AppError::from)?;
    Ok(Json(tokens))
}

/// Validate a token or API key
///
/// Always answers 200 with `{valid, reason?, claims?}`; the reason
/// distinguishes 401-class failures (re-authenticate) from 403-class ones
/// (right token, wrong context).
#[utoipa::path(
    post,
    path = "/auth/validate",
    request_body = ValidateRequest,
    responses(
        (status = 200, description = "Validation verdict", body = ValidateResponse),
        (status = 400, description = "Neither token nor api_key supplied")
    ),
    tag = "Authentication"
)]
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, AppError> {
    if let Some(token) = &request.token {
        let ip = request.ip.clone().or_else(|| client_ip(&headers));
        let verdict = state
            .tokens
            .validate(
                token,
                &request.audience,
                ip.as_deref(),
                request.device.as_deref(),
            )
            .await;
        return Ok(Json(match verdict {
            Ok(claims) => ValidateResponse::valid_claims(claims),
            Err(rejection) => ValidateResponse::invalid(rejection.reason()),
        }));
    }

    if let Some(api_key) = &request.api_key {
        return Ok(Json(match state.a2a.authenticate_key(api_key).await {
            Ok(app) => ValidateResponse::valid_api_key(app.client_id),
            Err(_) => ValidateResponse::invalid("INVALID_API_KEY"),
        }));
    }

    Err(AppError::BadRequest(anyhow::anyhow!(
        "either token or api_key is required"
    )))
}

/// Revoke a token
///
/// Idempotent; revoking a refresh token takes its whole rotation chain down.
#[utoipa::path(
    post,
    path = "/auth/revoke",
    request_body = RevokeRequest,
    responses(
        (status = 204, description = "Token revoked"),
        (status = 401, description = "Token could not be verified")
    ),
    tag = "Authentication"
)]
pub async fn revoke(
    State(state): State<AppState>,
    Json(request): Json<RevokeRequest>,
) -> Result<StatusCode, AppError> {
    request.validate()?;
    state
        .tokens
        .revoke(&request.token)
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn active_application(
    state: &AppState,
    client_id: &str,
) -> Result<Application, AppError> {
    let app = state
        .store
        .get_application(client_id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown application {}", client_id)))?;
    if !app.is_active {
        return Err(AppError::from(BrokerError::Configuration(format!(
            "application {} is inactive",
            client_id
        ))));
    }
    Ok(app)
}

fn check_redirect_uri(app: &Application, redirect_uri: &str) -> Result<(), AppError> {
    if app.redirect_uris.is_empty() || app.redirect_uris.iter().any(|u| u == redirect_uri) {
        Ok(())
    } else {
        Err(AppError::BadRequest(anyhow::anyhow!(
            "redirect_uri is not registered for {}",
            app.client_id
        )))
    }
}

/// Best-effort client IP from forwarding headers.
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
