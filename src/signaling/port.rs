//! Abstract signaling transport
//!
//! The engine only relies on per-destination ordered delivery: messages
//! from one sender to one receiver for the same session arrive in send
//! order. Delivery itself is not guaranteed, so sends are retried.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::messages::SignalingEnvelope;
use crate::config::RetryPolicy;
use crate::error::SignalingError;

pub type MessageHandler = Arc<dyn Fn(SignalingEnvelope) + Send + Sync>;

#[async_trait]
pub trait SignalingPort: Send + Sync {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError>;

    /// Registers the ingress handler for remote messages
    fn on_message(&self, handler: MessageHandler);
}

/// Sends with exponential backoff; non-retryable errors return at once
pub async fn send_with_retry(
    port: &dyn SignalingPort,
    envelope: SignalingEnvelope,
    policy: &RetryPolicy,
) -> Result<(), SignalingError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = SignalingError::NotConnected;

    for attempt in 1..=attempts {
        let backoff = policy.backoff_for(attempt);
        if !backoff.is_zero() {
            tokio::time::sleep(with_jitter(backoff)).await;
        }

        match port.send(envelope.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::debug!(
                    "Signaling {:?} to {} failed (attempt {}/{}): {}",
                    envelope.signal_type(),
                    envelope.to,
                    attempt,
                    attempts,
                    e
                );
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(
        "Giving up on {:?} to {} after {} attempts",
        envelope.signal_type(),
        envelope.to,
        attempts
    );
    Err(SignalingError::RetriesExhausted {
        attempts,
        last: last_error.to_string(),
    })
}

/// Up to 10% extra so simultaneous retries spread out
fn with_jitter(backoff: Duration) -> Duration {
    let max_extra = (backoff.as_millis() as u64) / 10;
    if max_extra == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra))
}
