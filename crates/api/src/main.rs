//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_broker::{RedisBroker, Topology, TopologyManager};
use herald_common::config::AppConfig;
use herald_common::db::{create_pool, run_migrations};
use herald_common::redis_pool::create_redis_pool;
use herald_engine::{EnqueueGateway, PgStatusStore, RedisIdempotencyCache};

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=debug,herald_broker=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;
    let jwt_secret = config
        .jwt_secret
        .clone()
        .ok_or_else(|| anyhow::anyhow!("JWT_SECRET environment variable is required"))?;

    let pool = create_pool(&config).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let broker = RedisBroker::connect(&config.broker_url, config.broker.claim_idle).await?;
    let manager = Arc::new(TopologyManager::new(
        Arc::new(broker),
        Topology::notifications(),
        config.broker.clone(),
    ));
    manager.connect().await?;
    tracing::info!("Broker topology declared");

    let gateway = EnqueueGateway::new(
        Arc::new(RedisIdempotencyCache::new(redis)),
        Arc::new(PgStatusStore::new(pool)),
        manager,
        Duration::from_secs(config.idempotency_ttl_secs),
    );
    let state = AppState::new(Arc::new(gateway), &jwt_secret);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
