use std::time::Duration;
use tracing::{error, info, warn};

use super::{QueueTransport, TransportError};

/// Fixed-delay, bounded connection retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// Connect `transport`, retrying per `policy`.
///
/// Exhausting the budget returns [`TransportError::RetriesExhausted`];
/// callers treat that as a fatal startup failure.
pub async fn connect_with_retry(
    transport: &dyn QueueTransport,
    policy: RetryPolicy,
) -> Result<(), TransportError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match transport.connect().await {
            Ok(()) => {
                info!(endpoint = %transport.endpoint(), attempt, "Broker connection ready");
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "Broker connection attempt {}/{} failed: {}",
                    attempt, attempts, e
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                error!(
                    endpoint = %transport.endpoint(),
                    "Failed to connect to broker after all retries"
                );
                return Err(TransportError::RetriesExhausted {
                    attempts,
                    last: Box::new(e),
                });
            }
        }
    }
}
