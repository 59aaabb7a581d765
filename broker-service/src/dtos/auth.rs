//! Auth surface DTOs: login, token exchange, refresh, validation, revocation.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::BrokerClaims;

/// Query parameters for login initiation.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginParams {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
}

/// Authorization-code exchange request.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct TokenRequest {
    /// Must be `authorization_code`.
    pub grant_type: String,
    #[validate(length(min = 1))]
    pub code: String,
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(length(min = 1))]
    pub redirect_uri: String,
    /// Optional device fingerprint for device-bound tokens.
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RevokeRequest {
    #[validate(length(min = 1))]
    pub token: String,
}

/// Validation request: either a bearer token or an API key.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidateRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// The validating application's own client_id.
    pub audience: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<BrokerClaims>,
    /// Authenticated application, for API-key validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ValidateResponse {
    pub fn valid_claims(claims: BrokerClaims) -> Self {
        Self {
            valid: true,
            reason: None,
            claims: Some(claims),
            client_id: None,
        }
    }

    pub fn valid_api_key(client_id: String) -> Self {
        Self {
            valid: true,
            reason: None,
            claims: None,
            client_id: Some(client_id),
        }
    }

    pub fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
            claims: None,
            client_id: None,
        }
    }
}
