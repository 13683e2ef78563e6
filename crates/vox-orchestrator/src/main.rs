//! vox-orchestrator entry point.
//!
//! Thin by design: load configuration, connect to Postgres, build shared
//! state, wire middleware, serve. All route handlers live in `routes.rs`;
//! all shared state lives in `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use vox_db::PostgresPersistence;
use vox_provider::HttpProviderClient;
use vox_registry::PostgresRegistry;
use vox_schemas::OwnerId;

use vox_orchestrator::{routes, state};

#[tokio::main]
async fn main() {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config = match vox_config::OrchestratorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    let pool = match vox_db::connect_from_env().await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "registry unreachable at startup");
            std::process::exit(2);
        }
    };
    if let Err(e) = vox_db::migrate(&pool).await {
        error!(error = %e, "migration failed at startup");
        std::process::exit(2);
    }

    let registry = PostgresRegistry::new(pool.clone());
    let provider = Arc::new(
        HttpProviderClient::new(
            provider_base_url_from_env(),
            config.max_concurrent_calls,
            config.max_concurrent_per_server,
        ),
    );
    let persistence = PostgresPersistence::new(pool);
    let owner_id = process_owner_id();

    let shared = Arc::new(state::AppState::new(registry, provider, persistence, owner_id, config));
    state::spawn_bus_heartbeat(shared.bus.clone(), std::time::Duration::from_secs(3));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8900)));
    info!("vox-orchestrator listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind listening socket");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server crashed");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("VOX_ORCHESTRATOR_ADDR").ok()?.parse().ok()
}

fn provider_base_url_from_env() -> String {
    std::env::var("ORCH_PROVIDER_BASE_URL").unwrap_or_else(|_| "http://localhost:9090".to_string())
}

/// Unique per-process identity for lock ownership; never collides with a
/// restarted incarnation of the same process thanks to the random nonce.
fn process_owner_id() -> OwnerId {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    OwnerId::new(&host, std::process::id(), &uuid::Uuid::new_v4().to_string())
}

/// CORS: allow only localhost origins, matching the rest of this workspace's
/// daemon binaries.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];
    let origins: Vec<HeaderValue> =
        allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
