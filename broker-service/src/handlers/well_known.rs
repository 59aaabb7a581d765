use crate::AppState;
use service_core::{
    axum::{Json, extract::State, http::header, response::IntoResponse},
    error::AppError,
};

/// Get JSON Web Key Set (JWKS)
///
/// Publishes the active signing key and any rotated-out keys still inside
/// their grace window, so resource servers can verify offline across a
/// rotation.
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public JWKS returned")
    ),
    tag = "Well-Known"
)]
pub async fn jwks(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let jwks = state.keyring.jwks()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=300"),
        ],
        Json(jwks),
    ))
}
