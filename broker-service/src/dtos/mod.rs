//! Request/response DTOs for the broker's REST surface.

pub mod admin;
pub mod auth;
pub mod discovery;

use serde::Serialize;
use utoipa::ToSchema;

/// Generic error body, mirroring the shared error responder.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
