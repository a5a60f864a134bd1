//! In-process broker with the same delivery semantics as the Redis transport.
//!
//! Used by `standalone` mode and by tests. Every [`MemoryTransport`] handed
//! out by a [`MemoryBroker`] behaves like an independent connection.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    DeliveryHandler, DeliveryPolicy, Disposition, Envelope, QueueTransport, TransportError,
    dispatch, until,
};

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<String>>,
    dead: Mutex<Vec<String>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push_back(&self, raw: String) {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(raw);
        self.notify.notify_one();
    }

    fn push_front(&self, raw: String) {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(raw);
        self.notify.notify_one();
    }

    fn bury(&self, raw: String) {
        self.dead
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(raw);
    }

    async fn next(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(raw) = self
                .ready
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return raw;
            }
            notified.await;
        }
    }
}

pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    policy: DeliveryPolicy,
}

impl MemoryBroker {
    pub fn new(policy: DeliveryPolicy) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            policy,
        })
    }

    /// Open a new connection to this broker.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(self),
            session: Mutex::new(None),
        }
    }

    /// Number of messages waiting for delivery on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.declare(queue)
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Bodies of the messages dead-lettered from `queue`, oldest first.
    pub fn dead_letters(&self, queue: &str) -> Vec<Value> {
        self.declare(queue)
            .dead
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|raw| match Envelope::decode(raw) {
                Ok(envelope) => envelope.body,
                Err(_) => Value::String(raw.clone()),
            })
            .collect()
    }

    fn declare(&self, queue: &str) -> Arc<MemoryQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(queues.entry(queue.to_string()).or_default())
    }
}

pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    session: Mutex<Option<CancellationToken>>,
}

impl MemoryTransport {
    fn session(&self) -> CancellationToken {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.get_or_insert_with(CancellationToken::new).clone()
    }

    /// Publish a raw, already-encoded payload. Lets tests inject bodies that
    /// are not valid envelopes.
    #[cfg(test)]
    pub(crate) fn publish_raw(&self, queue: &str, raw: &str) {
        self.broker.declare(queue).push_back(raw.to_string());
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.session();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value) -> Result<(), TransportError> {
        self.session();
        let raw = Envelope::new(message.clone()).encode()?;
        self.broker.declare(queue).push_back(raw);
        debug!(queue, "Published message");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let shutdown = self.session();
        let source = self.broker.declare(queue);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        info!(queue, "Started consuming from queue");

        loop {
            let raw = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = until(deadline) => return Ok(()),
                raw = source.next() => raw,
            };

            let envelope = match Envelope::decode(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(queue, "Dead-lettering undecodable message: {}", e);
                    source.bury(raw);
                    continue;
                }
            };

            match dispatch(handler.as_ref(), queue, &envelope, self.broker.policy).await {
                Disposition::Ack => {}
                Disposition::Requeue => source.push_front(envelope.redelivered().encode()?),
                Disposition::DeadLetter => source.bury(raw),
            }
        }
    }

    async fn close(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = session {
            token.cancel();
            debug!("Closed in-memory broker connection");
        }
    }

    fn endpoint(&self) -> String {
        "memory://local/".to_string()
    }
}
