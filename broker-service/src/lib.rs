pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use service_core::axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
};
use service_core::middleware::{
    rate_limit::ip_rate_limit_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::BrokerConfig;
use crate::services::{
    A2aBroker, BrokerStore, CapabilityRegistry, DiscoveryService, IdentityProvider, KeyRing,
    PermissionResolver, RevocationIndex, TokenService,
};
use service_core::error::AppError;
use std::sync::Arc;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::well_known::jwks,
        handlers::auth::login,
        handlers::auth::token,
        handlers::auth::refresh,
        handlers::auth::validate,
        handlers::auth::revoke,
        handlers::a2a::service_token,
        handlers::discovery::discover_app,
        handlers::discovery::batch_discover,
        handlers::discovery::discovery_history,
        handlers::discovery::discovery_stats,
        handlers::discovery::capability_graph,
        handlers::admin::create_app,
        handlers::admin::list_apps,
        handlers::admin::get_app,
        handlers::admin::deactivate_app,
        handlers::admin::issue_credential,
        handlers::admin::upsert_role,
        handlers::admin::list_roles,
        handlers::admin::delete_role,
        handlers::admin::create_mapping,
        handlers::admin::list_mappings,
        handlers::admin::delete_mapping,
        handlers::admin::upsert_a2a,
        handlers::admin::list_a2a,
        handlers::admin::delete_a2a,
        handlers::admin::rotate_keys,
        handlers::admin::audit_trail,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::LoginParams,
            dtos::auth::TokenRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::RevokeRequest,
            dtos::auth::ValidateRequest,
            dtos::auth::ValidateResponse,
            dtos::admin::RegisterAppRequest,
            dtos::admin::UpsertRoleRequest,
            dtos::admin::GrantDto,
            dtos::admin::RlsFilterDto,
            dtos::admin::MappingRequest,
            dtos::admin::A2aPermissionRequest,
            dtos::admin::CredentialResponse,
            dtos::admin::ServiceTokenRequest,
            dtos::admin::AuditQuery,
            dtos::discovery::BatchDiscoverRequest,
            dtos::discovery::DiscoverParams,
            dtos::discovery::DiscoveryDocument,
            dtos::discovery::DiscoveryEndpoint,
            dtos::discovery::DiscoveryField,
            handlers::admin::RoleSavedResponse,
            models::Application,
            models::ApiCredential,
            models::Role,
            models::Grant,
            models::GrantScope,
            models::GrantEffect,
            models::RlsFilter,
            models::FilterOperator,
            models::GroupRoleMapping,
            models::A2aPermission,
            models::AuditEvent,
            models::BrokerClaims,
            models::RlsFilterClaim,
            models::TokenType,
            models::CapabilityGraph,
            models::Endpoint,
            models::FieldMetadata,
            models::Category,
            models::DiscoveryRecord,
            models::DiscoveryStats,
            models::DiscoveryStatus,
            services::DiscoveryReport,
            services::ErrorClass,
            services::TokenResponse,
            services::ServiceTokenResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Login, token exchange, refresh, validation"),
        (name = "Service Authentication", description = "Application-to-application service tokens"),
        (name = "Discovery", description = "Capability discovery and reconciliation"),
        (name = "Admin", description = "Administrative operations"),
        (name = "Well-Known", description = "Public service metadata"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .build(),
                ),
            );
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("x-admin-api-key"))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: BrokerConfig,
    pub store: Arc<dyn BrokerStore>,
    pub registry: Arc<CapabilityRegistry>,
    pub discovery: Arc<DiscoveryService>,
    pub resolver: Arc<PermissionResolver>,
    pub keyring: Arc<KeyRing>,
    pub revocations: Arc<dyn RevocationIndex>,
    pub tokens: TokenService,
    pub a2a: A2aBroker,
    pub idp: Arc<dyn IdentityProvider>,
    pub token_rate_limiter: service_core::middleware::rate_limit::IpRateLimiter,
    pub a2a_rate_limiter: service_core::middleware::rate_limit::IpRateLimiter,
    pub ip_rate_limiter: service_core::middleware::rate_limit::IpRateLimiter,
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    // Admin routes, guarded by the admin API key.
    let admin_routes = Router::new()
        .route(
            "/admin/apps",
            post(handlers::admin::create_app).get(handlers::admin::list_apps),
        )
        .route(
            "/admin/apps/:client_id",
            get(handlers::admin::get_app).delete(handlers::admin::deactivate_app),
        )
        .route(
            "/admin/apps/:client_id/credentials",
            post(handlers::admin::issue_credential),
        )
        .route(
            "/admin/apps/:client_id/discover",
            post(handlers::discovery::discover_app),
        )
        .route(
            "/admin/apps/:client_id/discovery/history",
            get(handlers::discovery::discovery_history),
        )
        .route(
            "/admin/apps/:client_id/discovery/stats",
            get(handlers::discovery::discovery_stats),
        )
        .route(
            "/admin/apps/:client_id/graph",
            get(handlers::discovery::capability_graph),
        )
        .route(
            "/admin/discovery/batch",
            post(handlers::discovery::batch_discover),
        )
        .route(
            "/admin/apps/:client_id/roles",
            get(handlers::admin::list_roles),
        )
        .route(
            "/admin/apps/:client_id/roles/:role_name",
            put(handlers::admin::upsert_role).delete(handlers::admin::delete_role),
        )
        .route(
            "/admin/apps/:client_id/mappings",
            post(handlers::admin::create_mapping)
                .get(handlers::admin::list_mappings)
                .delete(handlers::admin::delete_mapping),
        )
        .route(
            "/admin/a2a",
            put(handlers::admin::upsert_a2a).get(handlers::admin::list_a2a),
        )
        .route(
            "/admin/a2a/:source_client_id/:target_client_id",
            delete(handlers::admin::delete_a2a),
        )
        .route("/admin/keys/rotate", post(handlers::admin::rotate_keys))
        .route("/admin/audit", get(handlers::admin::audit_trail))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    // Token issuance endpoints carry their own tighter rate limit.
    let token_limiter = state.token_rate_limiter.clone();
    let token_routes = Router::new()
        .route("/auth/token", post(handlers::auth::token))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .layer(from_fn_with_state(token_limiter, ip_rate_limit_middleware));

    let a2a_limiter = state.a2a_rate_limiter.clone();
    let a2a_routes = Router::new()
        .route("/a2a/token", post(handlers::a2a::service_token))
        .layer(from_fn_with_state(a2a_limiter, ip_rate_limit_middleware));

    let ip_limiter = state.ip_rate_limiter.clone();

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks));

    let swagger_enabled = match state.config.environment {
        crate::config::Environment::Dev => true,
        crate::config::Environment::Prod => match state.config.swagger.enabled {
            crate::config::SwaggerMode::Public | crate::config::SwaggerMode::Authenticated => true,
            crate::config::SwaggerMode::Disabled => false,
        },
    };

    if swagger_enabled {
        app =
            app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        // Keep the OpenAPI JSON for programmatic access even without the UI.
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { service_core::axum::Json(ApiDoc::openapi()) }),
        );
    }

    let app = app
        .route("/auth/login", get(handlers::auth::login))
        .route("/auth/validate", post(handlers::auth::validate))
        .route("/auth/revoke", post(handlers::auth::revoke))
        .merge(token_routes)
        .merge(a2a_routes)
        .merge(admin_routes)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        // Tracing spans carry the request id
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(
                    state
                        .config
                        .security
                        .allowed_origins
                        .iter()
                        .map(|o| {
                            o.parse::<service_core::axum::http::HeaderValue>()
                                .unwrap_or_else(|e| {
                                    tracing::error!(
                                        "Invalid CORS origin '{}': {}. Using fallback.",
                                        o,
                                        e
                                    );
                                    service_core::axum::http::HeaderValue::from_static("*")
                                })
                        })
                        .collect::<Vec<service_core::axum::http::HeaderValue>>(),
                )
                .allow_methods([
                    service_core::axum::http::Method::GET,
                    service_core::axum::http::Method::POST,
                    service_core::axum::http::Method::PUT,
                    service_core::axum::http::Method::DELETE,
                    service_core::axum::http::Method::OPTIONS,
                ])
                .allow_headers([
                    service_core::axum::http::header::AUTHORIZATION,
                    service_core::axum::http::header::CONTENT_TYPE,
                    service_core::axum::http::header::HeaderName::from_static("x-admin-api-key"),
                    service_core::axum::http::header::HeaderName::from_static("x-request-id"),
                ]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    service_core::axum::extract::State(state): service_core::axum::extract::State<AppState>,
) -> Result<service_core::axum::Json<serde_json::Value>, AppError> {
    state.revocations.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Revocation index health check failed");
        AppError::InternalError(e)
    })?;

    let kid = state.keyring.active_kid().map_err(|e| {
        tracing::error!(error = %e, "Key ring health check failed");
        AppError::InternalError(e)
    })?;

    Ok(service_core::axum::Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "revocation_index": "up",
            "signing_key": kid,
        }
    })))
}
