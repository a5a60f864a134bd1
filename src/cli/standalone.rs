use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{completion_client, correlation_limits};
use crate::core::config::Settings;
use crate::core::correlator::{CorrelationTable, ResponseConsumer};
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::{ChatStore, SqliteStore};
use crate::core::terminal::{GuideSection, print_link, print_success};
use crate::core::transport::MemoryBroker;
use crate::core::worker::WorkerService;
use crate::interfaces::web::{ApiServer, ApiServerConfig};

/// Gateway, response consumer and `workers` worker lanes sharing one in-memory broker.
pub async fn run(settings: Settings, workers: usize) -> Result<()> {
    let broker = MemoryBroker::new(settings.broker.delivery_policy());
    let retry = settings.broker.retry_policy();
    let table = CorrelationTable::new(correlation_limits(&settings));
    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::open(&settings.gateway.database_path)?);
    let llm = completion_client(&settings)?;

    info!(workers, model = %settings.llm.model, "Starting standalone relay");

    let mut manager = LifecycleManager::new();
    manager.attach(Arc::new(Mutex::new(ResponseConsumer::new(
        Arc::new(broker.transport()),
        Arc::clone(&table),
        settings.queues.response.clone(),
        retry,
    ))));
    for _ in 0..workers {
        manager.attach(Arc::new(Mutex::new(WorkerService::new(
            Arc::new(broker.transport()),
            Arc::new(broker.transport()),
            Arc::clone(&llm),
            settings.queues.request.clone(),
            settings.queues.response.clone(),
            retry,
            manager.fatal_sender(),
        ))));
    }
    manager.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        publisher: Arc::new(broker.transport()),
        table,
        store,
        request_queue: settings.queues.request.clone(),
        retry,
        gateway: settings.gateway.clone(),
        service: settings.service.clone(),
    }))));

    GuideSection::new("chat-relay standalone")
        .status("Workers", &workers.to_string())
        .status("Model", &settings.llm.model)
        .status("Database", &settings.gateway.database_path.display().to_string())
        .print();
    print_link(
        "API",
        &format!(
            "http://{}:{}",
            settings.gateway.api_host, settings.gateway.api_port
        ),
    );
    print_success("Press Ctrl+C to stop.");

    manager.run_until_signal().await
}
