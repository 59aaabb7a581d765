//! A2A broker - service tokens for application-to-application calls.
//!
//! A caller authenticates with its API key, names a target application and
//! the scopes it wants, and receives a short-lived, narrowly-scoped token.
//! Out-of-scope requests are rejected wholesale; there is no silent
//! truncation.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::models::{ApiCredential, Application, AuditEvent};
use crate::services::error::BrokerError;
use crate::services::store::BrokerStore;
use crate::services::token::TokenService;

const API_KEY_PREFIX: &str = "svc_live_";
const API_KEY_RANDOM_LEN: usize = 32;

/// Issued service token.
#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    /// Correlation id for audit joins across both systems' logs.
    pub a2a_id: String,
}

#[derive(Clone)]
pub struct A2aBroker {
    store: Arc<dyn BrokerStore>,
    tokens: TokenService,
    default_duration: Duration,
}

impl A2aBroker {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        tokens: TokenService,
        default_duration_seconds: i64,
    ) -> Self {
        Self {
            store,
            tokens,
            default_duration: Duration::seconds(default_duration_seconds),
        }
    }

    /// Mint a fresh API key for an application. The plaintext is returned
    /// exactly once; only hashes are stored. An existing key moves to the
    /// previous slot and stays valid for `previous_grace_hours`.
    pub async fn issue_api_key(
        &self,
        client_id: &str,
        previous_grace_hours: i64,
    ) -> Result<String, BrokerError> {
        let app = self
            .store
            .get_application(client_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("unknown application {}", client_id)))?;

        let api_key = generate_api_key();
        let api_key_hash = hash_api_key(&api_key)?;
        let lookup_hash = ApiCredential::calculate_lookup_hash(&api_key);

        let credential = match app.credential {
            Some(old) => ApiCredential {
                api_key_hash,
                api_key_lookup_hash: lookup_hash,
                previous_api_key_hash: Some(old.api_key_hash),
                previous_api_key_lookup_hash: Some(old.api_key_lookup_hash),
                previous_key_expiry: Some(Utc::now() + Duration::hours(previous_grace_hours)),
                enabled: true,
                created_at: Utc::now(),
                last_used_at: old.last_used_at,
            },
            None => ApiCredential::new(api_key_hash, lookup_hash),
        };

        self.store.set_credential(client_id, credential).await?;
        self.store
            .append_audit(AuditEvent::new("api_key_issued").client(client_id))
            .await?;

        Ok(api_key)
    }

    /// Resolve and verify the calling application from its API key.
    pub async fn authenticate_key(&self, api_key: &str) -> Result<Application, BrokerError> {
        if !api_key.starts_with(API_KEY_PREFIX) {
            return Err(BrokerError::Authentication(
                "invalid API key format".to_string(),
            ));
        }

        let lookup_hash = ApiCredential::calculate_lookup_hash(api_key);
        let app = self
            .store
            .find_application_by_lookup_hash(&lookup_hash)
            .await?
            .ok_or_else(|| BrokerError::Authentication("invalid API key".to_string()))?;

        let credential = app
            .credential
            .as_ref()
            .ok_or_else(|| BrokerError::Authentication("invalid API key".to_string()))?;
        if !credential.enabled {
            return Err(BrokerError::Authentication(
                "API key has been disabled".to_string(),
            ));
        }
        if !app.is_active {
            return Err(BrokerError::Authentication(format!(
                "application {} is inactive",
                app.client_id
            )));
        }

        let verified = if credential.api_key_lookup_hash == lookup_hash {
            verify_api_key(api_key, &credential.api_key_hash)
        } else {
            // Previous key: only honored inside its grace window.
            let in_grace = credential
                .previous_key_expiry
                .map(|expiry| expiry > Utc::now())
                .unwrap_or(false);
            in_grace
                && credential
                    .previous_api_key_hash
                    .as_deref()
                    .map(|hash| verify_api_key(api_key, hash))
                    .unwrap_or(false)
        };
        if !verified {
            return Err(BrokerError::Authentication("invalid API key".to_string()));
        }

        self.store.touch_credential_usage(&app.client_id).await?;
        Ok(app)
    }

    /// The A2A contract: authenticate, check the allow-list, contain scopes,
    /// clamp duration, issue.
    pub async fn request_service_token(
        &self,
        api_key: &str,
        target_client_id: &str,
        requested_scopes: &[String],
        duration_seconds: Option<i64>,
    ) -> Result<ServiceTokenResponse, BrokerError> {
        // Key validity first; A2A-specific checks only for authenticated
        // callers.
        let source = self.authenticate_key(api_key).await?;

        let target = self
            .store
            .get_application(target_client_id)
            .await?
            .ok_or_else(|| {
                BrokerError::NotFound(format!("unknown target application {}", target_client_id))
            })?;
        if !target.is_active {
            return Err(BrokerError::Configuration(format!(
                "target application {} is inactive",
                target.client_id
            )));
        }

        let permission = self
            .store
            .get_a2a_permission(&source.client_id, &target.client_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| BrokerError::NoPermission {
                from: source.client_id.clone(),
                target: target.client_id.clone(),
            })?;

        // Fail closed on any out-of-scope request: no partial token.
        let denied = permission.out_of_scope(requested_scopes);
        if !denied.is_empty() {
            return Err(BrokerError::ScopeDenied {
                denied: denied.into_iter().map(String::from).collect(),
            });
        }

        // No explicit request means everything the allow-list grants.
        let scopes = if requested_scopes.is_empty() {
            permission.allowed_scopes.clone()
        } else {
            requested_scopes.to_vec()
        };

        let requested_duration = duration_seconds
            .map(Duration::seconds)
            .unwrap_or(self.default_duration);
        let duration = requested_duration
            .min(Duration::seconds(permission.max_token_duration_seconds));

        let (token, claims) = self
            .tokens
            .issue_service_token(&source, &target.client_id, scopes, duration)
            .await?;

        Ok(ServiceTokenResponse {
            access_token: token,
            token_type: "Bearer".to_string(),
            expires_in: claims.exp - claims.iat,
            a2a_id: claims.a2a_id.unwrap_or_default(),
        })
    }
}

fn generate_api_key() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", API_KEY_PREFIX, random)
}

fn hash_api_key(api_key: &str) -> Result<String, BrokerError> {
    let argon2 = Argon2::default();
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(api_key.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("Failed to hash API key: {}", e)))
}

fn verify_api_key(api_key: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(api_key.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + API_KEY_RANDOM_LEN);
    }

    #[test]
    fn test_hash_and_verify_round_trip() {
        let key = generate_api_key();
        let hash = hash_api_key(&key).unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_api_key(&key, &hash));
        assert!(!verify_api_key("svc_live_wrong", &hash));
    }
}
