//! Test helpers for broker-service integration tests.
//!
//! Builds the full application state on in-memory collaborators and spawns
//! in-process HTTP targets for discovery tests.

#![allow(dead_code)]

use broker_service::{
    AppState,
    config::{
        BrokerConfig, DiscoveryConfig, Environment, IdentityProviderConfig, JwtConfig,
        RateLimitConfig, RedisConfig, SecurityConfig, SwaggerConfig, SwaggerMode,
    },
    models::{
        Application, Category, Endpoint, FieldMetadata, Grant, GrantEffect, GrantScope,
        GroupRoleMapping, Role,
    },
    services::{
        A2aBroker, BrokerStore, CapabilityRegistry, DiscoveryService, KeyRing, MemoryRevocationIndex,
        MemoryStore, PermissionResolver, RevocationIndex, StaticIdentityProvider, TokenService,
        VerifiedPrincipal,
    },
};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::net::TcpListener;

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-12345";

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        common: service_core::config::Config {
            port: 8080,
            shutdown_grace_seconds: 0,
        },
        environment: Environment::Dev,
        service_name: "broker-service".into(),
        service_version: "test".into(),
        log_level: "warn".into(),
        otlp_endpoint: None,
        jwt: JwtConfig {
            private_key_path: None,
            public_key_path: None,
            issuer: "broker-service".into(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            service_token_expiry_seconds: 300,
            key_grace_minutes: 60,
            token_version: 2,
        },
        idp: IdentityProviderConfig {
            authorize_url: "https://idp.invalid/authorize".into(),
            token_url: "https://idp.invalid/token".into(),
            userinfo_url: "https://idp.invalid/userinfo".into(),
            client_id: "broker".into(),
            client_secret: "secret".into(),
        },
        discovery: DiscoveryConfig {
            timeout_seconds: 2,
            max_response_bytes: 1_048_576,
            max_retries: 2,
            cache_window_minutes: 60,
            batch_concurrency: 5,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".into()],
            admin_api_key: TEST_ADMIN_API_KEY.into(),
        },
        redis: RedisConfig { url: None },
        swagger: SwaggerConfig {
            enabled: SwaggerMode::Disabled,
        },
        rate_limit: RateLimitConfig {
            token_attempts: 1000,
            token_window_seconds: 60,
            a2a_attempts: 1000,
            a2a_window_seconds: 60,
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        },
        sweep_interval_seconds: 3600,
    }
}

/// Fast backoff so retry tests stay quick.
pub fn quick_retry_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: std::time::Duration::from_millis(5),
        max_backoff: std::time::Duration::from_millis(20),
        backoff_multiplier: 2.0,
        add_jitter: false,
    }
}

/// Full broker state on in-memory collaborators.
pub struct TestBroker {
    pub state: AppState,
    pub idp: Arc<StaticIdentityProvider>,
}

impl TestBroker {
    pub async fn spawn() -> Self {
        let config = test_config();
        let store: Arc<dyn BrokerStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(CapabilityRegistry::new());
        let revocations: Arc<dyn RevocationIndex> = Arc::new(MemoryRevocationIndex::new());
        let keyring =
            Arc::new(KeyRing::ephemeral(Duration::minutes(60)).expect("Failed to build key ring"));

        let tokens = TokenService::new(
            &config.jwt,
            keyring.clone(),
            store.clone(),
            revocations.clone(),
        );
        let resolver = Arc::new(PermissionResolver::new(store.clone(), registry.clone()));
        let a2a = A2aBroker::new(
            store.clone(),
            tokens.clone(),
            config.jwt.service_token_expiry_seconds,
        );
        let discovery = Arc::new(
            DiscoveryService::new(
                store.clone(),
                registry.clone(),
                quick_retry_policy(config.discovery.max_retries),
                config.discovery.timeout_seconds,
                config.discovery.max_response_bytes,
                config.discovery.cache_window_minutes,
                config.discovery.batch_concurrency,
            )
            .expect("Failed to build discovery service"),
        );
        let idp = Arc::new(StaticIdentityProvider::new());

        let state = AppState {
            config: config.clone(),
            store,
            registry,
            discovery,
            resolver,
            keyring,
            revocations,
            tokens,
            a2a,
            idp: idp.clone(),
            token_rate_limiter: create_ip_rate_limiter(
                config.rate_limit.token_attempts,
                config.rate_limit.token_window_seconds,
            ),
            a2a_rate_limiter: create_ip_rate_limiter(
                config.rate_limit.a2a_attempts,
                config.rate_limit.a2a_window_seconds,
            ),
            ip_rate_limiter: create_ip_rate_limiter(
                config.rate_limit.global_ip_limit,
                config.rate_limit.global_ip_window_seconds,
            ),
        };

        Self { state, idp }
    }

    pub async fn register_app(&self, client_id: &str, discovery_url: Option<String>) -> Application {
        let mut app = Application::new(
            client_id.to_string(),
            format!("{} display", client_id),
            "platform-team".to_string(),
            vec!["http://localhost:3000/callback".to_string()],
            discovery_url,
            true,
        );
        self.state
            .store
            .upsert_application(app.clone())
            .await
            .expect("Failed to register application");
        app
    }

    /// Seed the registry with the canonical HR test graph:
    /// employees { id: base, email: pii, phone: pii, ssn: sensitive }.
    pub fn seed_hr_graph(&self, client_id: &str) -> u64 {
        self.state.registry.replace(
            client_id,
            vec![Endpoint {
                path: "/employees".into(),
                method: "GET".into(),
                resource: "employees".into(),
                action: "read".into(),
                description: None,
                response_fields: vec![
                    "id".into(),
                    "email".into(),
                    "phone".into(),
                    "ssn".into(),
                ],
            }],
            HashMap::from([(
                "employees".to_string(),
                vec![
                    field("id", Category::Base),
                    field("email", Category::Pii),
                    field("phone", Category::Pii),
                    field("ssn", Category::Sensitive),
                ],
            )]),
            Utc::now(),
        )
    }

    pub async fn seed_role(
        &self,
        client_id: &str,
        role_name: &str,
        grants: Vec<Grant>,
    ) -> Role {
        let mut role = Role::new(client_id.to_string(), role_name.to_string());
        role.grants = grants;
        self.state
            .store
            .upsert_role(role.clone())
            .await
            .expect("Failed to seed role");
        role
    }

    pub async fn map_group(&self, client_id: &str, group: &str, role: &str) {
        self.state
            .store
            .upsert_mapping(GroupRoleMapping {
                client_id: client_id.to_string(),
                group_name: group.to_string(),
                role_name: role.to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("Failed to map group");
    }
}

pub fn field(name: &str, category: Category) -> FieldMetadata {
    FieldMetadata {
        name: name.into(),
        field_type: "string".into(),
        category,
        nullable: false,
        description: None,
    }
}

pub fn allow(resource: &str, action: &str, scope: GrantScope) -> Grant {
    Grant {
        resource: resource.into(),
        action: action.into(),
        scope,
        effect: GrantEffect::Allow,
    }
}

pub fn deny(resource: &str, action: &str, scope: GrantScope) -> Grant {
    Grant {
        resource: resource.into(),
        action: action.into(),
        scope,
        effect: GrantEffect::Deny,
    }
}

pub fn principal(subject: &str, groups: &[&str]) -> VerifiedPrincipal {
    VerifiedPrincipal {
        subject: subject.to_string(),
        email: Some(format!("{}@example.com", subject)),
        display_name: Some(subject.to_string()),
        groups: groups.iter().map(|g| g.to_string()).collect(),
    }
}

/// One canned response from a discovery target.
pub struct TargetResponse {
    pub delay_ms: u64,
    pub status: StatusCode,
    pub body: String,
}

impl TargetResponse {
    pub fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            delay_ms: 0,
            status,
            body: body.to_string(),
        }
    }
}

type Responder = Arc<dyn Fn(u32) -> TargetResponse + Send + Sync>;

#[derive(Clone)]
struct TargetState {
    gets: Arc<AtomicU32>,
    responder: Responder,
}

/// In-process discovery target. `gets` counts GET fetches only, so probe
/// traffic does not skew retry assertions.
pub struct DiscoveryTarget {
    pub url: String,
    pub gets: Arc<AtomicU32>,
}

impl DiscoveryTarget {
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(u32) -> TargetResponse + Send + Sync + 'static,
    {
        let gets = Arc::new(AtomicU32::new(0));
        let target_state = TargetState {
            gets: gets.clone(),
            responder: Arc::new(responder),
        };

        async fn handle(State(state): State<TargetState>, request: Request<Body>) -> Response {
            let hit = if request.method() == Method::GET {
                state.gets.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                state.gets.load(Ordering::SeqCst)
            };
            let response = (state.responder)(hit);
            if response.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(response.delay_ms)).await;
            }
            (response.status, response.body).into_response()
        }

        let router = Router::new().fallback(handle).with_state(target_state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind discovery target");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("target server failed");
        });

        Self {
            url: format!("http://127.0.0.1:{}/discover", port),
            gets,
        }
    }

    pub fn get_count(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }
}

/// A conformant discovery document for `client_id` with the HR surface.
pub fn valid_discovery_document(client_id: &str) -> serde_json::Value {
    serde_json::json!({
        "app_id": client_id,
        "app_name": "HR Portal",
        "version": "2.0",
        "last_updated": "2026-08-01T10:00:00Z",
        "endpoints": [
            {
                "path": "/employees",
                "method": "GET",
                "resource": "employees",
                "action": "read",
                "description": "List employees",
                "response_fields": ["id", "email", "phone", "ssn"]
            },
            {
                "path": "/employees/{id}",
                "method": "DELETE",
                "resource": "employees",
                "action": "delete",
                "response_fields": []
            }
        ],
        "response_fields": {
            "employees": {
                "id": { "type": "string", "category": "base" },
                "email": { "type": "string", "category": "pii", "searchable": true },
                "phone": { "type": "string", "category": "pii", "nullable": true },
                "ssn": { "type": "string", "category": "sensitive", "max_length": 11 }
            }
        }
    })
}
