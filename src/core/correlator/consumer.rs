use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CorrelationTable;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::messages::ResultItem;
use crate::core::transport::{
    DeliveryHandler, HandlerError, QueueTransport, RetryPolicy, connect_with_retry,
};

pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Delivery handler that files every result into the correlation table.
pub struct StoreResults {
    table: Arc<CorrelationTable>,
}

impl StoreResults {
    pub fn new(table: Arc<CorrelationTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl DeliveryHandler for StoreResults {
    async fn handle(&self, body: Value) -> Result<(), HandlerError> {
        let result: ResultItem = serde_json::from_value(body)?;
        let (request_id, session_id) = (result.request_id, result.session_id);
        let outcome = self.table.store(result);
        debug!(
            request_id = %request_id,
            session_id = %session_id,
            outcome = ?outcome,
            "Stored chat response"
        );
        Ok(())
    }
}

/// The gateway's single background lane draining the response queue.
///
/// Owns its own broker connection. If `consume` fails or the consuming
/// task panics, it is started again after [`RESTART_DELAY`] until shutdown.
pub struct ResponseConsumer {
    transport: Arc<dyn QueueTransport>,
    table: Arc<CorrelationTable>,
    queue: String,
    retry: RetryPolicy,
    restart_delay: Duration,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ResponseConsumer {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        table: Arc<CorrelationTable>,
        queue: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            table,
            queue: queue.into(),
            retry,
            restart_delay: RESTART_DELAY,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }
}

async fn supervise(
    transport: Arc<dyn QueueTransport>,
    table: Arc<CorrelationTable>,
    queue: String,
    restart_delay: Duration,
    shutdown: CancellationToken,
) {
    let mut runs: u64 = 0;
    loop {
        runs += 1;
        let handler: Arc<dyn DeliveryHandler> = Arc::new(StoreResults::new(Arc::clone(&table)));
        let lane = {
            let transport = Arc::clone(&transport);
            let queue = queue.clone();
            tokio::spawn(async move { transport.consume(&queue, handler, None).await })
        };
        let joined = lane.await;

        if shutdown.is_cancelled() {
            break;
        }
        match joined {
            Ok(Ok(())) => warn!(queue = %queue, runs, "Response consumer exited unexpectedly"),
            Ok(Err(e)) => error!(queue = %queue, runs, "Response consumer failed: {}", e),
            Err(e) if e.is_panic() => error!(queue = %queue, runs, "Response consumer panicked"),
            Err(e) => error!(queue = %queue, runs, "Response consumer task aborted: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(restart_delay) => {
                info!(queue = %queue, "Restarting response consumer");
            }
        }
    }
    info!(queue = %queue, "Response consumer stopped");
}

#[async_trait]
impl LifecycleComponent for ResponseConsumer {
    async fn on_start(&mut self) -> Result<()> {
        connect_with_retry(self.transport.as_ref(), self.retry).await?;
        info!(queue = %self.queue, endpoint = %self.transport.endpoint(), "Starting response consumer");
        self.task = Some(tokio::spawn(supervise(
            Arc::clone(&self.transport),
            Arc::clone(&self.table),
            self.queue.clone(),
            self.restart_delay,
            self.shutdown.clone(),
        )));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.transport.close().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}
