//! Application model - registered client applications of the federation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

/// A registered client application.
///
/// Applications are soft-deactivated, never hard-deleted, so tokens that
/// reference one stay revocable and auditable.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Application {
    #[schema(example = "app_hr_portal")]
    pub client_id: String,
    pub display_name: String,
    pub owner: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub allow_discovery: bool,
    pub is_active: bool,
    /// When enabled, user tokens snapshot the requesting IP and validation
    /// fails closed on mismatch.
    #[serde(default)]
    pub ip_binding_enabled: bool,
    #[serde(default)]
    pub device_binding_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(read_only)]
    pub credential: Option<ApiCredential>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn new(
        client_id: String,
        display_name: String,
        owner: String,
        redirect_uris: Vec<String>,
        discovery_url: Option<String>,
        allow_discovery: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            display_name,
            owner,
            redirect_uris,
            discovery_url,
            allow_discovery,
            is_active: true,
            ip_binding_enabled: false,
            device_binding_enabled: false,
            credential: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// API-key credential for service-to-service calls.
///
/// The Argon2 hash is used for verification, the SHA-256 hex digest for
/// constant-cost lookup. Rotation keeps the previous pair alive until its
/// expiry so in-flight callers are not cut off mid-rotation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiCredential {
    #[schema(read_only)]
    pub api_key_hash: String,
    #[schema(read_only)]
    pub api_key_lookup_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(read_only)]
    pub previous_api_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(read_only)]
    pub previous_api_key_lookup_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key_expiry: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiCredential {
    pub fn new(api_key_hash: String, api_key_lookup_hash: String) -> Self {
        Self {
            api_key_hash,
            api_key_lookup_hash,
            previous_api_key_hash: None,
            previous_api_key_lookup_hash: None,
            previous_key_expiry: None,
            enabled: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// SHA-256 hex digest used to locate a credential without an Argon2 pass.
    pub fn calculate_lookup_hash(api_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_application_defaults() {
        let app = Application::new(
            "app_x".into(),
            "App X".into(),
            "platform".into(),
            vec![],
            None,
            false,
        );
        assert!(app.is_active);
        assert!(!app.ip_binding_enabled);
        assert!(app.credential.is_none());
    }

    #[test]
    fn test_lookup_hash_is_stable_hex() {
        let a = ApiCredential::calculate_lookup_hash("svc_live_abc");
        let b = ApiCredential::calculate_lookup_hash("svc_live_abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, ApiCredential::calculate_lookup_hash("svc_live_abd"));
    }
}
