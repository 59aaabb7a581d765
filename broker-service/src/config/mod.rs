use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub jwt: JwtConfig,
    pub idp: IdentityProviderConfig,
    pub discovery: DiscoveryConfig,
    pub security: SecurityConfig,
    pub redis: RedisConfig,
    pub swagger: SwaggerConfig,
    pub rate_limit: RateLimitConfig,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// PEM paths; when unset a key pair is generated at startup.
    pub private_key_path: Option<String>,
    pub public_key_path: Option<String>,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub service_token_expiry_seconds: i64,
    /// How long rotated-out public keys stay published and trusted.
    pub key_grace_minutes: i64,
    pub token_version: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    pub timeout_seconds: u64,
    pub max_response_bytes: usize,
    pub max_retries: u32,
    pub cache_window_minutes: i64,
    pub batch_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// When unset, the in-memory revocation index is used.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwaggerConfig {
    pub enabled: SwaggerMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SwaggerMode {
    Public,
    Authenticated,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub token_attempts: u32,
    pub token_window_seconds: u64,
    pub a2a_attempts: u32,
    pub a2a_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = BrokerConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("broker-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            jwt: JwtConfig {
                private_key_path: env::var("JWT_PRIVATE_KEY_PATH").ok(),
                public_key_path: env::var("JWT_PUBLIC_KEY_PATH").ok(),
                issuer: get_env("JWT_ISSUER", Some("broker-service"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "7",
                    is_prod,
                )?,
                service_token_expiry_seconds: parse_env(
                    "JWT_SERVICE_TOKEN_EXPIRY_SECONDS",
                    "300",
                    is_prod,
                )?,
                key_grace_minutes: parse_env("JWT_KEY_GRACE_MINUTES", "60", is_prod)?,
                token_version: parse_env("JWT_TOKEN_VERSION", "2", is_prod)?,
            },
            idp: IdentityProviderConfig {
                authorize_url: get_env("IDP_AUTHORIZE_URL", None, is_prod)?,
                token_url: get_env("IDP_TOKEN_URL", None, is_prod)?,
                userinfo_url: get_env("IDP_USERINFO_URL", None, is_prod)?,
                client_id: get_env("IDP_CLIENT_ID", None, is_prod)?,
                client_secret: get_env("IDP_CLIENT_SECRET", None, is_prod)?,
            },
            discovery: DiscoveryConfig {
                timeout_seconds: parse_env("DISCOVERY_TIMEOUT_SECONDS", "5", is_prod)?,
                max_response_bytes: parse_env("DISCOVERY_MAX_RESPONSE_BYTES", "1048576", is_prod)?,
                max_retries: parse_env("DISCOVERY_MAX_RETRIES", "3", is_prod)?,
                cache_window_minutes: parse_env("DISCOVERY_CACHE_WINDOW_MINUTES", "60", is_prod)?,
                batch_concurrency: parse_env("DISCOVERY_BATCH_CONCURRENCY", "5", is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
                admin_api_key: get_env("ADMIN_API_KEY", None, true)?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok(),
            },
            swagger: SwaggerConfig {
                enabled: get_env("ENABLE_SWAGGER", Some("public"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
            rate_limit: RateLimitConfig {
                token_attempts: parse_env("RATE_LIMIT_TOKEN_ATTEMPTS", "10", is_prod)?,
                token_window_seconds: parse_env("RATE_LIMIT_TOKEN_WINDOW_SECONDS", "60", is_prod)?,
                a2a_attempts: parse_env("RATE_LIMIT_A2A_ATTEMPTS", "30", is_prod)?,
                a2a_window_seconds: parse_env("RATE_LIMIT_A2A_WINDOW_SECONDS", "60", is_prod)?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", "100", is_prod)?,
                global_ip_window_seconds: parse_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    "60",
                    is_prod,
                )?,
            },
            sweep_interval_seconds: parse_env("SWEEP_INTERVAL_SECONDS", "300", is_prod)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.jwt.service_token_expiry_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SERVICE_TOKEN_EXPIRY_SECONDS must be positive"
            )));
        }

        if self.jwt.private_key_path.is_some() != self.jwt.public_key_path.is_some() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_PRIVATE_KEY_PATH and JWT_PUBLIC_KEY_PATH must be set together"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.jwt.private_key_path.is_none() {
                tracing::warn!(
                    "No signing key configured; a generated key will not survive restarts"
                );
            }

            if self.swagger.enabled == SwaggerMode::Public {
                tracing::error!(
                    "Swagger is publicly accessible in production - consider 'authenticated' or 'disabled'"
                );
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
        })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for SwaggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(SwaggerMode::Public),
            "authenticated" => Ok(SwaggerMode::Authenticated),
            "disabled" => Ok(SwaggerMode::Disabled),
            _ => Err(format!("Invalid swagger mode: {}", s)),
        }
    }
}
