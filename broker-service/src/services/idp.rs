//! Identity-provider boundary.
//!
//! The provider protocol is an opaque collaborator: the broker hands it an
//! authorization code and gets back a verified principal with group
//! memberships. The OIDC implementation speaks the standard code-exchange +
//! userinfo shape; tests use the static provider.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::config::IdentityProviderConfig;
use crate::services::error::BrokerError;

/// An authenticated principal as vouched for by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPrincipal {
    pub subject: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub groups: Vec<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The URL to redirect a browser to for login.
    fn authorize_url(&self, client_id: &str, redirect_uri: &str, state: &str) -> String;

    /// Exchange an authorization code for a verified principal.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<VerifiedPrincipal, BrokerError>;
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
}

pub struct OidcIdentityProvider {
    http: reqwest::Client,
    config: IdentityProviderConfig,
}

impl OidcIdentityProvider {
    pub fn new(config: IdentityProviderConfig) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build identity-provider client: {}", e))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl IdentityProvider for OidcIdentityProvider {
    fn authorize_url(&self, client_id: &str, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}&scope=openid%20profile%20email",
            self.config.authorize_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<VerifiedPrincipal, BrokerError> {
        let token_response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = token_response.status();
        if status.is_client_error() {
            return Err(BrokerError::Authentication(format!(
                "identity provider rejected the authorization code ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(BrokerError::Server(format!(
                "identity provider token endpoint returned {}",
                status
            )));
        }

        let token: TokenEndpointResponse = token_response
            .json()
            .await
            .map_err(|e| BrokerError::Validation(format!("malformed token response: {}", e)))?;

        let userinfo_response = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(transport_error)?;

        if !userinfo_response.status().is_success() {
            return Err(BrokerError::Authentication(format!(
                "identity provider userinfo endpoint returned {}",
                userinfo_response.status()
            )));
        }

        let userinfo: UserInfoResponse = userinfo_response
            .json()
            .await
            .map_err(|e| BrokerError::Validation(format!("malformed userinfo response: {}", e)))?;

        Ok(VerifiedPrincipal {
            subject: userinfo.sub,
            email: userinfo.email,
            display_name: userinfo.name,
            groups: userinfo.groups,
        })
    }
}

fn transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout(err.to_string())
    } else {
        BrokerError::Network(err.to_string())
    }
}

/// Static provider for tests and local development: codes are registered up
/// front and exchanged at most the configured number of times.
#[derive(Default)]
pub struct StaticIdentityProvider {
    principals: DashMap<String, VerifiedPrincipal>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_code(&self, code: impl Into<String>, principal: VerifiedPrincipal) {
        self.principals.insert(code.into(), principal);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn authorize_url(&self, client_id: &str, redirect_uri: &str, state: &str) -> String {
        format!(
            "https://idp.invalid/authorize?client_id={}&redirect_uri={}&state={}",
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<VerifiedPrincipal, BrokerError> {
        // One-time use, like a real authorization code.
        self.principals
            .remove(code)
            .map(|(_, principal)| principal)
            .ok_or_else(|| {
                BrokerError::Authentication("unknown or already-used authorization code".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_codes_are_one_time_use() {
        let idp = StaticIdentityProvider::new();
        idp.register_code(
            "code-1",
            VerifiedPrincipal {
                subject: "user-1".into(),
                email: Some("user@example.com".into()),
                display_name: None,
                groups: vec!["HR".into()],
            },
        );

        let principal = idp.exchange_code("code-1", "http://cb").await.unwrap();
        assert_eq!(principal.subject, "user-1");

        let err = idp.exchange_code("code-1", "http://cb").await.unwrap_err();
        assert!(matches!(err, BrokerError::Authentication(_)));
    }

    #[test]
    fn test_authorize_url_escapes_parameters() {
        let idp = StaticIdentityProvider::new();
        let url = idp.authorize_url("app x", "http://cb?x=1", "st&ate");
        assert!(url.contains("app%20x"));
        assert!(url.contains("http%3A%2F%2Fcb%3Fx%3D1"));
        assert!(url.contains("st%26ate"));
    }
}
