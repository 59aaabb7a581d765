use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::RetryClass;
use thiserror::Error;
use utoipa::ToSchema;

/// Failure classification for discovery and other outbound calls.
/// Transient classes are retry-eligible; everything else surfaces at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    NetworkError,
    TimeoutError,
    AuthenticationError,
    ValidationError,
    ConfigurationError,
    ServerError,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::NetworkError | ErrorClass::TimeoutError | ErrorClass::ServerError
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::NetworkError => "NETWORK_ERROR",
            ErrorClass::TimeoutError => "TIMEOUT_ERROR",
            ErrorClass::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorClass::ValidationError => "VALIDATION_ERROR",
            ErrorClass::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorClass::ServerError => "SERVER_ERROR",
        }
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Remote server error: {0}")]
    Server(String),

    #[error("Token has been revoked")]
    Revoked,

    #[error("Token expired")]
    Expired,

    #[error("Binding mismatch: {0}")]
    BindingMismatch(String),

    #[error("Requested scopes exceed the allowed set: {}", denied.join(", "))]
    ScopeDenied { denied: Vec<String> },

    #[error("No A2A permission configured for {from} -> {target}")]
    NoPermission { from: String, target: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// Discovery-style classification, where applicable.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            BrokerError::Network(_) => Some(ErrorClass::NetworkError),
            BrokerError::Timeout(_) => Some(ErrorClass::TimeoutError),
            BrokerError::Authentication(_) => Some(ErrorClass::AuthenticationError),
            BrokerError::Validation(_) => Some(ErrorClass::ValidationError),
            BrokerError::Configuration(_) => Some(ErrorClass::ConfigurationError),
            BrokerError::Server(_) => Some(ErrorClass::ServerError),
            _ => None,
        }
    }
}

impl RetryClass for BrokerError {
    fn is_transient(&self) -> bool {
        self.class().map(|c| c.is_transient()).unwrap_or(false)
    }

    fn class_label(&self) -> &'static str {
        self.class().map(|c| c.label()).unwrap_or("INTERNAL")
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Network(m) => AppError::BadGateway(m),
            BrokerError::Timeout(m) => AppError::BadGateway(m),
            BrokerError::Server(m) => AppError::BadGateway(m),
            BrokerError::Authentication(m) => AppError::AuthError(anyhow::anyhow!(m)),
            BrokerError::Validation(m) => AppError::BadRequest(anyhow::anyhow!(m)),
            BrokerError::Configuration(m) => AppError::BadRequest(anyhow::anyhow!(m)),
            BrokerError::Revoked => AppError::AuthError(anyhow::anyhow!("Token has been revoked")),
            BrokerError::Expired => AppError::AuthError(anyhow::anyhow!("Token expired")),
            // Contextually misused but cryptographically valid: 403, not 401.
            BrokerError::BindingMismatch(m) => AppError::Forbidden(anyhow::anyhow!(m)),
            BrokerError::ScopeDenied { denied } => AppError::Forbidden(anyhow::anyhow!(
                "Requested scopes exceed the allowed set: {}",
                denied.join(", ")
            )),
            BrokerError::NoPermission { from: source, target } => AppError::Forbidden(anyhow::anyhow!(
                "No A2A permission configured for {} -> {}",
                source,
                target
            )),
            BrokerError::NotFound(m) => AppError::NotFound(anyhow::anyhow!(m)),
            BrokerError::Conflict(m) => AppError::Conflict(anyhow::anyhow!(m)),
            BrokerError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classes() {
        assert!(ErrorClass::NetworkError.is_transient());
        assert!(ErrorClass::TimeoutError.is_transient());
        assert!(ErrorClass::ServerError.is_transient());
        assert!(!ErrorClass::AuthenticationError.is_transient());
        assert!(!ErrorClass::ValidationError.is_transient());
        assert!(!ErrorClass::ConfigurationError.is_transient());
    }

    #[test]
    fn test_broker_error_retry_classification() {
        assert!(RetryClass::is_transient(&BrokerError::Timeout("t".into())));
        assert!(!RetryClass::is_transient(&BrokerError::Validation(
            "v".into()
        )));
        assert!(!RetryClass::is_transient(&BrokerError::Revoked));
    }
}
