//! Gateway-side correlation of asynchronous results with in-flight requests.
//!
//! A request handler registers its request id *before* publishing the work
//! item and gets a [`PendingReply`]. When the response consumer stores a
//! [`ResultItem`], it is handed straight to the registered waiter. Results
//! nobody is waiting for are parked, and parked results are evicted by age
//! and by count so abandoned replies cannot grow the table without bound.

pub mod consumer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::messages::ResultItem;

pub use consumer::{ResponseConsumer, StoreResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationLimits {
    pub max_parked: usize,
    pub parked_ttl: Duration,
}

impl Default for CorrelationLimits {
    fn default() -> Self {
        Self {
            max_parked: 1024,
            parked_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Handed to the waiter registered for this request id.
    Delivered,
    /// No waiter; kept until popped or evicted.
    Parked,
    /// No waiter; overwrote an earlier parked result for the same id.
    Replaced,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("no result for request {request_id} within {waited:?}")]
    Timeout { request_id: Uuid, waited: Duration },

    #[error("wait for request {request_id} was superseded by a newer registration")]
    Closed { request_id: Uuid },
}

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<ResultItem>,
}

struct Parked {
    result: ResultItem,
    at: Instant,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<Uuid, Waiter>,
    parked: HashMap<Uuid, Parked>,
    next_ticket: u64,
}

pub struct CorrelationTable {
    inner: Mutex<Inner>,
    limits: CorrelationLimits,
}

impl CorrelationTable {
    pub fn new(limits: CorrelationLimits) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            limits,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a delivery slot for `request_id`. Call before publishing.
    pub fn register(self: &Arc<Self>, request_id: Uuid) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        if inner.pending.insert(request_id, Waiter { ticket, tx }).is_some() {
            warn!(request_id = %request_id, "Request id registered twice, superseding earlier waiter");
        }
        PendingReply {
            table: Arc::clone(self),
            request_id,
            ticket,
            rx,
            settled: false,
        }
    }

    /// Insert an arrived result. Last write wins for a duplicated request id.
    pub fn store(&self, result: ResultItem) -> StoreOutcome {
        let request_id = result.request_id;
        let mut inner = self.lock();
        let result = match inner.pending.remove(&request_id) {
            Some(waiter) => match waiter.tx.send(result) {
                Ok(()) => {
                    debug!(request_id = %request_id, "Result handed to waiting request");
                    return StoreOutcome::Delivered;
                }
                Err(result) => result,
            },
            None => result,
        };
        self.park(&mut inner, result)
    }

    /// Remove and return a parked result. At most one caller gets it.
    pub fn pop(&self, request_id: Uuid) -> Option<ResultItem> {
        self.lock().parked.remove(&request_id).map(|p| p.result)
    }

    pub fn contains(&self, request_id: Uuid) -> bool {
        self.lock().parked.contains_key(&request_id)
    }

    pub fn parked_len(&self) -> usize {
        self.lock().parked.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn park(&self, inner: &mut Inner, result: ResultItem) -> StoreOutcome {
        let now = Instant::now();
        let ttl = self.limits.parked_ttl;
        inner.parked.retain(|id, p| {
            let keep = now.duration_since(p.at) < ttl;
            if !keep {
                warn!(request_id = %id, "Evicting unclaimed result past its TTL");
            }
            keep
        });

        let request_id = result.request_id;
        let outcome = match inner.parked.insert(request_id, Parked { result, at: now }) {
            Some(_) => StoreOutcome::Replaced,
            None => StoreOutcome::Parked,
        };
        info!(request_id = %request_id, outcome = ?outcome, "Parked result with no waiting request");

        while inner.parked.len() > self.limits.max_parked {
            let oldest = inner
                .parked
                .iter()
                .min_by_key(|(_, p)| p.at)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    inner.parked.remove(&id);
                    warn!(request_id = %id, "Evicting oldest unclaimed result, table full");
                }
                None => break,
            }
        }
        outcome
    }

    /// Drop a waiter's slot. A result handed over at the same instant is parked.
    fn release(&self, request_id: Uuid, ticket: u64, rx: &mut oneshot::Receiver<ResultItem>) {
        let mut inner = self.lock();
        if inner
            .pending
            .get(&request_id)
            .is_some_and(|w| w.ticket == ticket)
        {
            inner.pending.remove(&request_id);
            return;
        }
        if let Ok(late) = rx.try_recv() {
            warn!(request_id = %request_id, "Result arrived as its waiter gave up");
            self.park(&mut inner, late);
        }
    }
}

/// One request's claim on its future result.
pub struct PendingReply {
    table: Arc<CorrelationTable>,
    request_id: Uuid,
    ticket: u64,
    rx: oneshot::Receiver<ResultItem>,
    settled: bool,
}

impl PendingReply {
    /// Wait at most `timeout` for the result.
    ///
    /// A result that arrives after the deadline is never returned; it stays
    /// parked in the table until popped or evicted.
    pub async fn wait(mut self, timeout: Duration) -> Result<ResultItem, WaitError> {
        if let Some(result) = self.table.pop(self.request_id) {
            return Ok(result);
        }

        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => {
                self.settled = true;
                Ok(result)
            }
            Ok(Err(_)) => Err(WaitError::Closed {
                request_id: self.request_id,
            }),
            Err(_) => {
                warn!(request_id = %self.request_id, waited = ?timeout, "Timed out waiting for result");
                Err(WaitError::Timeout {
                    request_id: self.request_id,
                    waited: timeout,
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.table
                .release(self.request_id, self.ticket, &mut self.rx);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::messages::TokenUsage;

    pub(crate) fn result_for(request_id: Uuid, response: &str) -> ResultItem {
        ResultItem {
            request_id,
            session_id: Uuid::new_v4(),
            prompt: "hello".to_string(),
            response: response.to_string(),
            usage: TokenUsage::default(),
            processing_time: 0.1,
            timestamp: 0.0,
        }
    }

    const MAX_WAIT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn round_trip_returns_exactly_the_stored_reply() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        let pending = table.register(x);

        assert_eq!(table.store(result_for(x, "hello-reply")), StoreOutcome::Delivered);
        let got = pending.wait(MAX_WAIT).await.unwrap();
        assert_eq!(got.response, "hello-reply");
        assert_eq!(table.pending_len(), 0);
        assert_eq!(table.parked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_never_see_each_others_results() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let ids: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
        let waiters: Vec<_> = ids
            .iter()
            .map(|id| {
                let pending = table.register(*id);
                tokio::spawn(async move { pending.wait(MAX_WAIT).await })
            })
            .collect();

        // deliver in reverse order
        for id in ids.iter().rev() {
            table.store(result_for(*id, &format!("reply-{id}")));
        }

        for (id, waiter) in ids.iter().zip(waiters) {
            let got = waiter.await.unwrap().unwrap();
            assert_eq!(got.request_id, *id);
            assert_eq!(got.response, format!("reply-{id}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn result_stored_before_the_deadline_is_observed_immediately() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        let pending = table.register(x);
        let started = Instant::now();

        let writer = Arc::clone(&table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(59_900)).await;
            writer.store(result_for(x, "just in time"));
        });

        let got = pending.wait(MAX_WAIT).await.unwrap();
        assert_eq!(got.response, "just in time");
        assert_eq!(started.elapsed(), Duration::from_millis(59_900));
    }

    #[tokio::test(start_paused = true)]
    async fn result_stored_after_the_deadline_is_never_observed() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        let pending = table.register(x);
        let started = Instant::now();

        let err = pending.wait(MAX_WAIT).await.unwrap_err();
        assert_eq!(
            err,
            WaitError::Timeout {
                request_id: x,
                waited: MAX_WAIT
            }
        );
        // no polling: the waiter gives up exactly at the deadline
        assert_eq!(started.elapsed(), MAX_WAIT);
        assert_eq!(table.pending_len(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(table.store(result_for(x, "too late")), StoreOutcome::Parked);
        assert!(table.contains(x));
    }

    #[tokio::test(start_paused = true)]
    async fn result_racing_the_deadline_is_parked_not_lost() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        let pending = table.register(x);

        // handed over, but the waiter goes away without claiming it
        assert_eq!(table.store(result_for(x, "raced")), StoreOutcome::Delivered);
        drop(pending);

        assert_eq!(table.pending_len(), 0);
        assert_eq!(table.pop(x).unwrap().response, "raced");
    }

    #[test]
    fn pop_is_exactly_once() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        table.store(result_for(x, "once"));

        assert_eq!(table.pop(x).unwrap().response, "once");
        assert!(table.pop(x).is_none());
        assert!(!table.contains(x));
    }

    #[test]
    fn duplicate_store_overwrites() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        assert_eq!(table.store(result_for(x, "first")), StoreOutcome::Parked);
        assert_eq!(table.store(result_for(x, "second")), StoreOutcome::Replaced);
        assert_eq!(table.parked_len(), 1);
        assert_eq!(table.pop(x).unwrap().response, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn parked_result_is_claimed_by_a_later_waiter() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        table.store(result_for(x, "early"));

        let got = table.register(x).wait(MAX_WAIT).await.unwrap();
        assert_eq!(got.response, "early");
        assert_eq!(table.parked_len(), 0);
        assert_eq!(table.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_results_expire_after_ttl() {
        let table = CorrelationTable::new(CorrelationLimits {
            max_parked: 1024,
            parked_ttl: Duration::from_secs(300),
        });
        let old = Uuid::new_v4();
        table.store(result_for(old, "abandoned"));

        tokio::time::advance(Duration::from_secs(299)).await;
        table.store(result_for(Uuid::new_v4(), "fresh"));
        assert!(table.contains(old));

        tokio::time::advance(Duration::from_secs(2)).await;
        table.store(result_for(Uuid::new_v4(), "fresher"));
        assert!(!table.contains(old));
        assert_eq!(table.parked_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_result_is_evicted_when_full() {
        let table = CorrelationTable::new(CorrelationLimits {
            max_parked: 2,
            parked_ttl: Duration::from_secs(300),
        });
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            table.store(result_for(*id, "x"));
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(table.parked_len(), 2);
        assert!(!table.contains(ids[0]));
        assert!(table.contains(ids[1]));
        assert!(table.contains(ids[2]));
    }

    #[tokio::test(start_paused = true)]
    async fn second_registration_supersedes_the_first() {
        let table = CorrelationTable::new(CorrelationLimits::default());
        let x = Uuid::new_v4();
        let first = table.register(x);
        let second = table.register(x);

        assert_eq!(
            first.wait(MAX_WAIT).await.unwrap_err(),
            WaitError::Closed { request_id: x }
        );
        // releasing the stale waiter must not remove the live slot
        assert_eq!(table.pending_len(), 1);

        table.store(result_for(x, "to the newest"));
        assert_eq!(second.wait(MAX_WAIT).await.unwrap().response, "to the newest");
    }
}
