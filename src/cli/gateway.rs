use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::correlation_limits;
use crate::core::config::Settings;
use crate::core::correlator::{CorrelationTable, ResponseConsumer};
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::{ChatStore, SqliteStore};
use crate::core::terminal::GuideSection;
use crate::core::transport::RedisTransport;
use crate::core::transport::redis_queue::redact;
use crate::interfaces::web::{ApiServer, ApiServerConfig};

pub async fn run(settings: Settings) -> Result<()> {
    let url = settings.broker.url()?;
    let policy = settings.broker.delivery_policy();
    let retry = settings.broker.retry_policy();
    let table = CorrelationTable::new(correlation_limits(&settings));
    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::open(&settings.gateway.database_path)?);

    info!(
        broker = %redact(&url),
        request_queue = %settings.queues.request,
        response_queue = %settings.queues.response,
        "Starting gateway"
    );

    let mut manager = LifecycleManager::new();
    // Consumer first: results must have somewhere to land before requests are accepted
    manager.attach(Arc::new(Mutex::new(ResponseConsumer::new(
        Arc::new(RedisTransport::new(url.clone(), policy)),
        Arc::clone(&table),
        settings.queues.response.clone(),
        retry,
    ))));
    manager.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        publisher: Arc::new(RedisTransport::new(url.clone(), policy)),
        table,
        store,
        request_queue: settings.queues.request.clone(),
        retry,
        gateway: settings.gateway.clone(),
        service: settings.service.clone(),
    }))));

    GuideSection::new("chat-relay gateway")
        .status(
            "API",
            &format!(
                "http://{}:{}",
                settings.gateway.api_host, settings.gateway.api_port
            ),
        )
        .status("Broker", &redact(&url))
        .status(
            "Queues",
            &format!("{} -> {}", settings.queues.request, settings.queues.response),
        )
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();

    manager.run_until_signal().await
}
