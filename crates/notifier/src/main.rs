use std::sync::Arc;

use futures::future::join_all;

use herald_broker::{RedisBroker, Topology, TopologyManager};
use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::PgStatusStore;
use herald_notifier::breaker::BreakerRegistry;
use herald_notifier::cache::RedisWorkerCache;
use herald_notifier::sender::build_sender;
use herald_notifier::template::HttpTemplateClient;
use herald_notifier::worker::DeliveryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_broker=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config).await?;
    let store = Arc::new(PgStatusStore::new(pool));
    let cache = Arc::new(RedisWorkerCache::new(create_redis_pool(&config.redis_url).await?));
    let templates = Arc::new(HttpTemplateClient::new(config.template_service_url.clone()));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));

    let mut consumers = Vec::new();
    for &channel in &config.worker.channels {
        let worker = Arc::new(DeliveryWorker::new(
            store.clone(),
            cache.clone(),
            templates.clone(),
            build_sender(channel, &config),
            breakers.clone(),
            config.worker.clone(),
        ));
        // A blocking read holds its connection, so each consumer gets its own.
        let broker = RedisBroker::connect(&config.broker_url, config.broker.claim_idle).await?;
        let manager = TopologyManager::new(
            Arc::new(broker),
            Topology::notifications(),
            config.broker.clone(),
        );
        manager.connect().await?;
        let queue = TopologyManager::queue_for(channel);
        let consumer = format!("{}-{}", channel, uuid::Uuid::new_v4());

        tracing::info!(%channel, queue, consumer = %consumer, "Starting delivery worker");
        consumers.push(tokio::spawn(async move {
            manager.consume(queue, &consumer, worker.as_ref()).await;
        }));
    }

    tokio::select! {
        _ = join_all(consumers) => {
            tracing::error!("All delivery workers exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
