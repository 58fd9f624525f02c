use keygate_platform_access::{
    HttpJwksSource, HttpTokenEndpoint, IdentityMapper, JwksCache, LogoutCoordinator, TokenManager,
    TokenVerifier,
};
use keygate_server::{
    auth::{
        AppState, OidcClient,
        db::{SessionRepository, UserRepository},
    },
    config::ServerConfig,
    router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    config
        .oidc
        .validate()
        .expect("invalid OIDC configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    // Cleanup expired sessions on startup
    let session_repo = SessionRepository::new(db_pool.clone());
    match session_repo.delete_expired().await {
        Ok(count) if count > 0 => {
            tracing::info!(
                deleted_sessions = count,
                "Cleaned up expired sessions on startup"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Failed to cleanup expired sessions on startup");
        }
    }

    // Spawn periodic session cleanup task
    let cleanup_pool = db_pool.clone();
    let cleanup_interval_secs = config.session.cleanup_interval_seconds;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(cleanup_interval_secs));
        loop {
            interval.tick().await;
            let repo = SessionRepository::new(cleanup_pool.clone());
            match repo.delete_expired().await {
                Ok(count) if count > 0 => {
                    tracing::debug!(deleted_sessions = count, "Periodic session cleanup");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to cleanup expired sessions");
                }
            }
        }
    });

    let oidc = config.oidc;

    let token_endpoint =
        HttpTokenEndpoint::from_config(&oidc).expect("failed to create token endpoint client");
    let token_manager =
        TokenManager::new(Arc::new(token_endpoint)).with_expiry_skew(oidc.expiry_skew());

    let identity = IdentityMapper::new(Arc::new(UserRepository::new(db_pool.clone())))
        .with_group_prefix(oidc.group_prefix());

    let logout = LogoutCoordinator::from_config(&oidc).expect("invalid logout configuration");

    let verifier = if config.verify_gate_tokens {
        let source = HttpJwksSource::new(oidc.issuer_url(), oidc.certs_endpoint())
            .expect("failed to create JWKS client");
        let keys = JwksCache::new(Arc::new(source), oidc.jwks_cache_ttl());
        tracing::info!("Role gates verify token signatures");
        Some(Arc::new(TokenVerifier::new(keys)))
    } else {
        None
    };

    let http = reqwest::Client::builder()
        .timeout(oidc.refresh_timeout())
        .build()
        .expect("failed to create HTTP client");

    // Initialize OIDC client
    tracing::info!("Discovering OIDC provider...");
    let oidc_client = OidcClient::discover(oidc)
        .await
        .expect("failed to discover OIDC provider");

    let app_state = Arc::new(AppState {
        db_pool,
        oidc_client,
        session_config: config.session,
        token_manager,
        identity,
        logout,
        http,
        downstream_api_url: config.downstream_api_url,
        verifier,
    });

    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
