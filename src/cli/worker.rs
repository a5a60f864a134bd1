use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::completion_client;
use crate::core::config::Settings;
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal::GuideSection;
use crate::core::transport::RedisTransport;
use crate::core::transport::redis_queue::redact;
use crate::core::worker::WorkerService;

pub async fn run(settings: Settings) -> Result<()> {
    let url = settings.broker.url()?;
    let policy = settings.broker.delivery_policy();
    let llm = completion_client(&settings)?;

    info!(
        broker = %redact(&url),
        model = %settings.llm.model,
        max_deliveries = policy.max_deliveries,
        "Starting worker"
    );

    let mut manager = LifecycleManager::new();
    let service = WorkerService::new(
        Arc::new(RedisTransport::new(url.clone(), policy)),
        Arc::new(RedisTransport::new(url.clone(), policy)),
        llm,
        settings.queues.request.clone(),
        settings.queues.response.clone(),
        settings.broker.retry_policy(),
        manager.fatal_sender(),
    );
    manager.attach(Arc::new(Mutex::new(service)));

    GuideSection::new("chat-relay worker")
        .status("Broker", &redact(&url))
        .status("Model", &settings.llm.model)
        .status(
            "Queues",
            &format!("{} -> {}", settings.queues.request, settings.queues.response),
        )
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();

    manager.run_until_signal().await
}
