//! Token claim set and refresh-token tracking records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use utoipa::ToSchema;

use super::role::FilterOperator;

/// Token flavor, carried in the `token_type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
    Service,
}

/// One RLS filter snapshot inside a token: the expression verbatim plus its
/// combination operator. The broker never evaluates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RlsFilterClaim {
    #[serde(rename = "expr")]
    pub expression: String,
    #[serde(rename = "op")]
    pub operator: FilterOperator,
}

/// Full claim set of a broker-issued JWT.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BrokerClaims {
    /// Principal (user id or source client_id for service tokens).
    pub sub: String,
    pub iss: String,
    /// Target application client_id, or `internal-services`.
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub token_type: TokenType,
    pub token_version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Resolved `resource.action[.category|.field]` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// `"resource.action"` -> filter snapshots.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[schema(value_type = Object)]
    pub rls_filters: HashMap<String, Vec<RlsFilterClaim>>,
    /// Group memberships, carried on refresh tokens so rotation can
    /// re-resolve permissions without another identity-provider round trip.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_device: Option<String>,
    /// Correlation id for A2A audit joins across both systems' logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a2a_id: Option<String>,
}

/// Tracked state of one refresh token. The raw token is never stored, only
/// its SHA-256 digest; `parent_token_hash` links the rotation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub jti: String,
    pub subject: String,
    pub client_id: String,
    pub token_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token_hash: Option<String>,
    /// Set when rotated away; presenting a superseded token is a replay.
    #[serde(default)]
    pub superseded: bool,
    #[serde(default)]
    pub revoked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshRecord {
    pub fn new(
        jti: String,
        subject: String,
        client_id: String,
        token: &str,
        parent_token_hash: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            jti,
            subject,
            client_id,
            token_hash: Self::hash_token(token),
            parent_token_hash,
            superseded: false,
            revoked: false,
            expires_at,
            created_at: Utc::now(),
        }
    }

    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_usable(&self) -> bool {
        !self.is_expired() && !self.superseded && !self.revoked
    }
}
