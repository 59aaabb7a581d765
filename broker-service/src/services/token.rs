//! Token issuance and validation.
//!
//! Issuance resolves permissions, assembles the claim set, signs with the
//! active key, and records the activity. Validation is a pure function over
//! the current key ring and revocation index with ordered terminal outcomes;
//! 401-class failures (bad token) are distinguished from 403-class ones
//! (valid token, wrong context).

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, Validation, decode, decode_header, errors::ErrorKind};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::{
    Application, AuditEvent, BrokerClaims, RefreshRecord, TokenType,
};
use crate::services::error::BrokerError;
use crate::services::idp::VerifiedPrincipal;
use crate::services::keys::KeyRing;
use crate::services::resolver::{PermissionResolver, ResolvedPermissions};
use crate::services::revocation::RevocationIndex;
use crate::services::store::{BrokerStore, RotateOutcome};

/// Audience accepted for platform-internal calls next to the app's own id.
pub const INTERNAL_AUDIENCE: &str = "internal-services";

/// Terminal validation outcomes. No retries: validation is pure over the
/// current key/revocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenRejection {
    Malformed,
    BadSignature,
    Expired,
    NotYetValid,
    Revoked,
    WrongAudience,
    IpMismatch,
    DeviceMismatch,
    WrongTokenType,
}

impl TokenRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            TokenRejection::Malformed => "MALFORMED",
            TokenRejection::BadSignature => "BAD_SIGNATURE",
            TokenRejection::Expired => "EXPIRED",
            TokenRejection::NotYetValid => "NOT_YET_VALID",
            TokenRejection::Revoked => "REVOKED",
            TokenRejection::WrongAudience => "WRONG_AUDIENCE",
            TokenRejection::IpMismatch => "IP_MISMATCH",
            TokenRejection::DeviceMismatch => "DEVICE_MISMATCH",
            TokenRejection::WrongTokenType => "WRONG_TOKEN_TYPE",
        }
    }

    /// 403-class: the token is cryptographically valid but contextually
    /// misused. Everything else is 401-class.
    pub fn is_context_failure(&self) -> bool {
        matches!(
            self,
            TokenRejection::WrongAudience
                | TokenRejection::IpMismatch
                | TokenRejection::DeviceMismatch
        )
    }
}

/// Token pair returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenService {
    keyring: Arc<KeyRing>,
    store: Arc<dyn BrokerStore>,
    revocations: Arc<dyn RevocationIndex>,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    token_version: u32,
}

impl TokenService {
    pub fn new(
        config: &JwtConfig,
        keyring: Arc<KeyRing>,
        store: Arc<dyn BrokerStore>,
        revocations: Arc<dyn RevocationIndex>,
    ) -> Self {
        Self {
            keyring,
            store,
            revocations,
            issuer: config.issuer.clone(),
            access_ttl: Duration::minutes(config.access_token_expiry_minutes),
            refresh_ttl: Duration::days(config.refresh_token_expiry_days),
            token_version: config.token_version,
        }
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Issue an access/refresh pair for an authenticated principal.
    pub async fn issue_user_tokens(
        &self,
        principal: &VerifiedPrincipal,
        app: &Application,
        resolved: &ResolvedPermissions,
        request_ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<TokenResponse, BrokerError> {
        let bound_ip = match (app.ip_binding_enabled, request_ip) {
            (true, Some(ip)) => Some(ip.to_string()),
            (true, None) => {
                return Err(BrokerError::Validation(
                    "IP binding is enabled but the client IP is unavailable".to_string(),
                ))
            }
            (false, _) => None,
        };
        let bound_device = match (app.device_binding_enabled, device) {
            (true, Some(d)) => Some(d.to_string()),
            (true, None) => {
                return Err(BrokerError::Validation(
                    "device binding is enabled but no device fingerprint was presented"
                        .to_string(),
                ))
            }
            (false, _) => None,
        };

        let now = Utc::now();
        let access_claims = BrokerClaims {
            sub: principal.subject.clone(),
            iss: self.issuer.clone(),
            aud: app.client_id.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: TokenType::Access,
            token_version: self.token_version,
            roles: resolved.roles.clone(),
            permissions: resolved.permissions.clone(),
            rls_filters: resolved.rls_filters.clone(),
            groups: Vec::new(),
            email: principal.email.clone(),
            name: principal.display_name.clone(),
            bound_ip: bound_ip.clone(),
            bound_device: bound_device.clone(),
            a2a_id: None,
        };

        let refresh_claims = BrokerClaims {
            jti: Uuid::new_v4().to_string(),
            exp: (now + self.refresh_ttl).timestamp(),
            token_type: TokenType::Refresh,
            // Refresh tokens carry no resolved permissions; rotation
            // re-resolves from the group snapshot.
            roles: Vec::new(),
            permissions: Vec::new(),
            rls_filters: Default::default(),
            groups: principal.groups.clone(),
            ..access_claims.clone()
        };

        let access_token = self.keyring.sign(&access_claims)?;
        let refresh_token = self.keyring.sign(&refresh_claims)?;

        self.store
            .insert_refresh(RefreshRecord::new(
                refresh_claims.jti.clone(),
                principal.subject.clone(),
                app.client_id.clone(),
                &refresh_token,
                None,
                now + self.refresh_ttl,
            ))
            .await?;

        let mut event = AuditEvent::new("token_issued")
            .subject(&principal.subject)
            .client(&app.client_id)
            .detail("access+refresh");
        if let Some(ip) = request_ip {
            event = event.ip(ip);
        }
        self.store.append_audit(event).await?;

        Ok(TokenResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds(),
        })
    }

    /// Rotate a refresh token: one-time use, atomically superseded, replay
    /// revokes the whole chain.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        resolver: &PermissionResolver,
        request_ip: Option<&str>,
    ) -> Result<TokenResponse, BrokerError> {
        let claims = self
            .verify_signature(refresh_token)
            .map_err(rejection_to_error)?;
        let now = Utc::now();
        if claims.exp <= now.timestamp() {
            return Err(BrokerError::Expired);
        }
        if claims.token_type != TokenType::Refresh {
            return Err(BrokerError::Authentication(
                "presented token is not a refresh token".to_string(),
            ));
        }
        if self
            .revocations
            .is_revoked(&claims.jti)
            .await
            .map_err(BrokerError::Internal)?
        {
            return Err(BrokerError::Revoked);
        }

        let app = self
            .store
            .get_application(&claims.aud)
            .await?
            .ok_or_else(|| {
                BrokerError::Configuration(format!("unknown application {}", claims.aud))
            })?;
        if !app.is_active {
            return Err(BrokerError::Configuration(format!(
                "application {} is inactive",
                app.client_id
            )));
        }

        let principal = VerifiedPrincipal {
            subject: claims.sub.clone(),
            email: claims.email.clone(),
            display_name: claims.name.clone(),
            groups: claims.groups.clone(),
        };
        let resolved = resolver.resolve(&principal.groups, &app.client_id).await?;

        let old_hash = RefreshRecord::hash_token(refresh_token);
        let new_refresh_claims = BrokerClaims {
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.refresh_ttl).timestamp(),
            ..claims.clone()
        };
        let new_refresh_token = self.keyring.sign(&new_refresh_claims)?;
        let new_record = RefreshRecord::new(
            new_refresh_claims.jti.clone(),
            claims.sub.clone(),
            app.client_id.clone(),
            &new_refresh_token,
            Some(old_hash.clone()),
            now + self.refresh_ttl,
        );

        match self.store.rotate_refresh(&old_hash, new_record).await? {
            RotateOutcome::Rotated => {}
            RotateOutcome::Reuse { revoked_jtis } => {
                // Replay of a superseded token is a security event: the whole
                // chain is already dead in the store; mirror it in the index.
                for jti in &revoked_jtis {
                    self.revocations
                        .revoke(jti, self.refresh_ttl.num_seconds())
                        .await
                        .map_err(BrokerError::Internal)?;
                }
                self.store
                    .append_audit(
                        AuditEvent::new("refresh_replay_detected")
                            .subject(&claims.sub)
                            .client(&app.client_id)
                            .detail(format!("chain of {} tokens revoked", revoked_jtis.len())),
                    )
                    .await?;
                tracing::warn!(
                    subject = %claims.sub,
                    client_id = %app.client_id,
                    revoked = revoked_jtis.len(),
                    "Refresh token reuse detected, chain revoked"
                );
                return Err(BrokerError::Authentication(
                    "refresh token has already been used; session revoked".to_string(),
                ));
            }
        }

        let access_claims = BrokerClaims {
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            token_type: TokenType::Access,
            roles: resolved.roles.clone(),
            permissions: resolved.permissions.clone(),
            rls_filters: resolved.rls_filters.clone(),
            groups: Vec::new(),
            ..claims.clone()
        };
        let access_token = self.keyring.sign(&access_claims)?;

        let mut event = AuditEvent::new("token_refreshed")
            .subject(&claims.sub)
            .client(&app.client_id);
        if let Some(ip) = request_ip {
            event = event.ip(ip);
        }
        self.store.append_audit(event).await?;

        Ok(TokenResponse {
            access_token,
            refresh_token: new_refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds(),
        })
    }

    /// Issue a short-lived service token for the A2A broker.
    pub async fn issue_service_token(
        &self,
        source: &Application,
        target_client_id: &str,
        scopes: Vec<String>,
        duration: Duration,
    ) -> Result<(String, BrokerClaims), BrokerError> {
        let now = Utc::now();
        let claims = BrokerClaims {
            sub: source.client_id.clone(),
            iss: self.issuer.clone(),
            aud: target_client_id.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + duration).timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: TokenType::Service,
            token_version: self.token_version,
            roles: Vec::new(),
            permissions: scopes,
            rls_filters: Default::default(),
            groups: Vec::new(),
            email: None,
            name: None,
            bound_ip: None,
            bound_device: None,
            a2a_id: Some(Uuid::new_v4().to_string()),
        };
        let token = self.keyring.sign(&claims)?;

        self.store
            .append_audit(
                AuditEvent::new("a2a_token_issued")
                    .subject(&source.client_id)
                    .client(target_client_id)
                    .detail(format!(
                        "a2a_id={} scopes={}",
                        claims.a2a_id.as_deref().unwrap_or(""),
                        claims.permissions.join(",")
                    )),
            )
            .await?;

        Ok((token, claims))
    }

    /// Validate a presented token against audience and binding context.
    pub async fn validate(
        &self,
        token: &str,
        expected_aud: &str,
        request_ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<BrokerClaims, TokenRejection> {
        let claims = self.verify_signature(token)?;
        let now = Utc::now().timestamp();

        if claims.exp <= now {
            return Err(TokenRejection::Expired);
        }
        if claims.nbf > now {
            return Err(TokenRejection::NotYetValid);
        }

        // Deny-by-default: an unreadable revocation index rejects rather
        // than letting a possibly-revoked token through.
        match self.revocations.is_revoked(&claims.jti).await {
            Ok(true) => return Err(TokenRejection::Revoked),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "Revocation index lookup failed during validation");
                return Err(TokenRejection::Revoked);
            }
        }

        if claims.aud != expected_aud && claims.aud != INTERNAL_AUDIENCE {
            return Err(TokenRejection::WrongAudience);
        }

        if let Some(bound) = &claims.bound_ip {
            match request_ip {
                Some(ip) if ip == bound => {}
                _ => return Err(TokenRejection::IpMismatch),
            }
        }
        if let Some(bound) = &claims.bound_device {
            match device {
                Some(d) if d == bound => {}
                _ => return Err(TokenRejection::DeviceMismatch),
            }
        }

        Ok(claims)
    }

    /// Revoke a token by jti. Idempotent; refresh tokens take their whole
    /// chain down with them.
    pub async fn revoke(&self, token: &str) -> Result<(), BrokerError> {
        let claims = self.verify_signature(token).map_err(rejection_to_error)?;

        let now = Utc::now().timestamp();
        let ttl = (claims.exp - now).max(1);
        self.revocations
            .revoke(&claims.jti, ttl)
            .await
            .map_err(BrokerError::Internal)?;

        if claims.token_type == TokenType::Refresh {
            let hash = RefreshRecord::hash_token(token);
            let chain = self.store.revoke_refresh_chain(&hash).await?;
            for jti in &chain {
                self.revocations
                    .revoke(jti, self.refresh_ttl.num_seconds())
                    .await
                    .map_err(BrokerError::Internal)?;
            }
        }

        self.store
            .append_audit(
                AuditEvent::new("token_revoked")
                    .subject(&claims.sub)
                    .client(&claims.aud),
            )
            .await?;
        Ok(())
    }

    /// Signature and structural verification only; temporal, revocation, and
    /// context checks stay with the caller so reasons are precise.
    fn verify_signature(&self, token: &str) -> Result<BrokerClaims, TokenRejection> {
        let header = decode_header(token).map_err(|_| TokenRejection::Malformed)?;
        if header.alg != Algorithm::RS256 {
            return Err(TokenRejection::BadSignature);
        }

        let verifiers = match self.keyring.verifiers() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Key ring unavailable during validation");
                return Err(TokenRejection::BadSignature);
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        for (kid, key) in &verifiers {
            if let Some(header_kid) = &header.kid {
                if header_kid != kid {
                    continue;
                }
            }
            match decode::<BrokerClaims>(token, key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => match e.kind() {
                    ErrorKind::InvalidSignature
                    | ErrorKind::InvalidAlgorithm
                    | ErrorKind::InvalidRsaKey(_) => continue,
                    _ => return Err(TokenRejection::Malformed),
                },
            }
        }

        // No trusted key verified it: unknown kid or plain bad signature.
        Err(TokenRejection::BadSignature)
    }
}

fn rejection_to_error(rejection: TokenRejection) -> BrokerError {
    match rejection {
        TokenRejection::Expired => BrokerError::Expired,
        TokenRejection::Revoked => BrokerError::Revoked,
        TokenRejection::IpMismatch | TokenRejection::DeviceMismatch => {
            BrokerError::BindingMismatch(rejection.reason().to_string())
        }
        other => BrokerError::Authentication(format!("invalid token: {}", other.reason())),
    }
}
