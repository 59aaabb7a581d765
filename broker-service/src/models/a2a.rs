//! A2A permission model - the source→target allow-list for service tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Grants one application the right to request service tokens for another.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct A2aPermission {
    pub source_client_id: String,
    pub target_client_id: String,
    /// Canonical `.`-delimited permission strings the source may request.
    pub allowed_scopes: Vec<String>,
    /// Upper bound for issued service-token lifetime, in seconds.
    pub max_token_duration_seconds: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl A2aPermission {
    pub fn new(
        source_client_id: String,
        target_client_id: String,
        allowed_scopes: Vec<String>,
        max_token_duration_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            source_client_id,
            target_client_id,
            allowed_scopes,
            max_token_duration_seconds,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Scopes in `requested` that are not covered by `allowed_scopes`.
    /// An empty return means the request is fully contained.
    pub fn out_of_scope<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .filter(|s| !self.allowed_scopes.contains(s))
            .map(|s| s.as_str())
            .collect()
    }
}
