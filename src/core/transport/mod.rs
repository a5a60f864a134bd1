//! Queue transport: a thin seam over an at-least-once message broker.
//!
//! One [`QueueTransport`] value is one broker connection. Producers and
//! consumers never share a connection, because `consume` occupies its
//! connection for as long as it runs.

pub mod memory;
pub mod redis_queue;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

pub use memory::{MemoryBroker, MemoryTransport};
pub use redis_queue::RedisTransport;
pub use retry::{RetryPolicy, connect_with_retry};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to broker at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("failed to publish to queue '{queue}': {reason}")]
    Publish { queue: String, reason: String },

    #[error("consumer on queue '{queue}' failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker unreachable after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

/// Failure reported by a [`DeliveryHandler`]; decides how the message is rejected.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The body does not match the expected schema. Redelivery cannot help.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Processing failed; the broker may redeliver the message.
    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handle one decoded message body. `Ok` acknowledges, `Err` rejects.
    async fn handle(&self, body: Value) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Establish the connection. Calling it on a live connection is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Encode `message` and append it to the durable queue `queue`.
    async fn publish(&self, queue: &str, message: &Value) -> Result<(), TransportError>;

    /// Deliver messages from `queue` to `handler` one at a time.
    ///
    /// Runs until [`QueueTransport::close`] is called, or for at most
    /// `timeout` when one is given. An empty queue is not an error.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError>;

    /// Release the connection and stop any running `consume`. Idempotent.
    async fn close(&self);

    /// Broker endpoint with credentials redacted, for logs.
    fn endpoint(&self) -> String;
}

/// Serialize `item` and publish it.
pub async fn publish_item<T: Serialize + ?Sized>(
    transport: &dyn QueueTransport,
    queue: &str,
    item: &T,
) -> Result<(), TransportError> {
    let message = serde_json::to_value(item)?;
    transport.publish(queue, &message).await
}

/// Redelivery policy applied by the broker implementations on reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Total delivery attempts before a rejected message is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self { max_deliveries: 5 }
    }
}

/// Wire format shared by the broker implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: Uuid,
    #[serde(default)]
    pub deliveries: u32,
    pub body: Value,
}

impl Envelope {
    pub fn new(body: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            deliveries: 0,
            body,
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn redelivered(&self) -> Self {
        Self {
            id: self.id,
            deliveries: self.deliveries.saturating_add(1),
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Run the handler for one envelope and decide what the broker does with it.
pub(crate) async fn dispatch(
    handler: &dyn DeliveryHandler,
    queue: &str,
    envelope: &Envelope,
    policy: DeliveryPolicy,
) -> Disposition {
    match handler.handle(envelope.body.clone()).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            let attempt = envelope.deliveries.saturating_add(1);
            if e.is_retryable() && attempt < policy.max_deliveries {
                warn!(
                    queue,
                    message_id = %envelope.id,
                    attempt,
                    "Error processing message, requeueing: {}",
                    e
                );
                Disposition::Requeue
            } else {
                error!(
                    queue,
                    message_id = %envelope.id,
                    attempt,
                    "Error processing message, dead-lettering: {}",
                    e
                );
                Disposition::DeadLetter
            }
        }
    }
}

pub(crate) fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}:dead")
}

/// Resolves at `deadline`, or never when there is none.
pub(crate) async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
