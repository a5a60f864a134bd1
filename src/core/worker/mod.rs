//! Worker lane: pull a [`WorkItem`], run the completion, push a [`ResultItem`].
//!
//! The worker never retries on its own. A failed completion is reported
//! back to the transport as a rejection and the broker's delivery policy
//! decides whether another delivery happens.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::lifecycle::{FatalSender, LifecycleComponent};
use crate::core::llm::CompletionClient;
use crate::core::messages::{ResultItem, WorkItem, epoch_seconds};
use crate::core::transport::{
    DeliveryHandler, HandlerError, QueueTransport, RetryPolicy, connect_with_retry, publish_item,
};

/// Time allowed for an in-flight completion to finish after shutdown starts.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct ChatWorker {
    publisher: Arc<dyn QueueTransport>,
    llm: Arc<dyn CompletionClient>,
    response_queue: String,
}

impl ChatWorker {
    pub fn new(
        publisher: Arc<dyn QueueTransport>,
        llm: Arc<dyn CompletionClient>,
        response_queue: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            llm,
            response_queue: response_queue.into(),
        }
    }

    /// Complete one work item and publish its result.
    pub async fn process(&self, item: WorkItem) -> Result<ResultItem> {
        info!(
            request_id = %item.request_id,
            session_id = %item.session_id,
            history = item.conversation_history.len(),
            "Processing chat request"
        );

        let started = Instant::now();
        let completion = self.llm.complete(&item.model_input()).await?;
        let processing_time = started.elapsed().as_secs_f64();

        let result = ResultItem {
            request_id: item.request_id,
            session_id: item.session_id,
            prompt: item.prompt,
            response: completion.text,
            usage: completion.usage,
            processing_time,
            timestamp: epoch_seconds(),
        };
        publish_item(self.publisher.as_ref(), &self.response_queue, &result).await?;

        info!(
            request_id = %result.request_id,
            session_id = %result.session_id,
            processing_time,
            total_tokens = result.usage.total_tokens,
            "Published chat response"
        );
        Ok(result)
    }
}

#[async_trait]
impl DeliveryHandler for ChatWorker {
    async fn handle(&self, body: Value) -> Result<(), HandlerError> {
        let item: WorkItem = serde_json::from_value(body)?;
        self.process(item).await?;
        Ok(())
    }
}

/// Runs one [`ChatWorker`] against the request queue for the life of the process.
pub struct WorkerService {
    consumer: Arc<dyn QueueTransport>,
    publisher: Arc<dyn QueueTransport>,
    worker: Arc<ChatWorker>,
    request_queue: String,
    retry: RetryPolicy,
    fatal: FatalSender,
    task: Option<JoinHandle<()>>,
}

impl WorkerService {
    /// `consumer` and `publisher` must be separate connections.
    pub fn new(
        consumer: Arc<dyn QueueTransport>,
        publisher: Arc<dyn QueueTransport>,
        llm: Arc<dyn CompletionClient>,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
        retry: RetryPolicy,
        fatal: FatalSender,
    ) -> Self {
        let worker = Arc::new(ChatWorker::new(
            Arc::clone(&publisher),
            llm,
            response_queue,
        ));
        Self {
            consumer,
            publisher,
            worker,
            request_queue: request_queue.into(),
            retry,
            fatal,
            task: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for WorkerService {
    async fn on_start(&mut self) -> Result<()> {
        connect_with_retry(self.consumer.as_ref(), self.retry).await?;
        connect_with_retry(self.publisher.as_ref(), self.retry).await?;

        let consumer = Arc::clone(&self.consumer);
        let handler: Arc<dyn DeliveryHandler> = self.worker.clone();
        let queue = self.request_queue.clone();
        let fatal = self.fatal.clone();
        info!(queue = %queue, model = %self.worker.llm.model(), "Worker waiting for chat requests");
        self.task = Some(tokio::spawn(async move {
            match consumer.consume(&queue, handler, None).await {
                Ok(()) => info!(queue = %queue, "Worker stopped consuming"),
                Err(e) => fatal.report(anyhow!(e).context("worker lost its broker connection")),
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.consumer.close().await;
        if let Some(task) = self.task.take()
            && tokio::time::timeout(DRAIN_GRACE, task).await.is_err()
        {
            warn!("Worker did not finish its current request before shutdown");
        }
        self.publisher.close().await;
        Ok(())
    }
}
