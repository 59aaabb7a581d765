use broker_service::{
    AppState, build_router,
    config::BrokerConfig,
    services::{
        A2aBroker, BrokerStore, CapabilityRegistry, DiscoveryService, KeyRing,
        MemoryRevocationIndex, MemoryStore, OidcIdentityProvider, PermissionResolver,
        RedisRevocationIndex, RevocationIndex, TokenService, spawn_sweeper,
    },
};
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::observability::logging::init_tracing;
use service_core::retry::RetryPolicy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = BrokerConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting token broker"
    );

    // The persistent store is a collaborator boundary; the in-process
    // implementation is the reference one.
    let store: Arc<dyn BrokerStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(CapabilityRegistry::new());

    let revocations: Arc<dyn RevocationIndex> = match &config.redis.url {
        Some(url) => Arc::new(RedisRevocationIndex::new(url).await?),
        None => {
            tracing::warn!("No REDIS_URL configured; using the in-memory revocation index");
            Arc::new(MemoryRevocationIndex::new())
        }
    };

    let keyring = Arc::new(KeyRing::from_config(&config.jwt)?);
    tracing::info!("Key ring initialized");

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

    let discovery = Arc::new(DiscoveryService::new(
        store.clone(),
        registry.clone(),
        RetryPolicy::with_max_retries(config.discovery.max_retries),
        config.discovery.timeout_seconds,
        config.discovery.max_response_bytes,
        config.discovery.cache_window_minutes,
        config.discovery.batch_concurrency,
    )?);
    tracing::info!("Discovery reconciler initialized");

    let idp = Arc::new(OidcIdentityProvider::new(config.idp.clone())?);

    let token_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.token_attempts,
        config.rate_limit.token_window_seconds,
    );
    let a2a_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.a2a_attempts,
        config.rate_limit.a2a_window_seconds,
    );
    let ip_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.global_ip_limit,
        config.rate_limit.global_ip_window_seconds,
    );
    tracing::info!("Rate limiters initialized: Token, A2A, and Global IP");

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        registry,
        discovery,
        resolver,
        keyring: keyring.clone(),
        revocations: revocations.clone(),
        tokens,
        a2a,
        idp,
        token_rate_limiter,
        a2a_rate_limiter,
        ip_rate_limiter,
    };

    // The one background task: idempotent pruning of expired state.
    let _sweeper = spawn_sweeper(
        store,
        revocations,
        keyring,
        config.sweep_interval_seconds,
    );

    let app = build_router(state).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.common.shutdown_grace_seconds))
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(grace_seconds: u64) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    // Give in-flight requests time to complete
    tokio::time::sleep(tokio::time::Duration::from_secs(grace_seconds)).await;
}
