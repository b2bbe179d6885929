//! Relay transport client.
//!
//! The relay is an opaque store-and-forward service: it moves envelope
//! bytes and never sees plaintext. It may redeliver and reorder; the
//! ratchet's replay and skip logic is the sole correctness boundary
//! against that, so this layer only has to be honest about failure.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use vesper_core::{Environment, ProtocolError, UserId};

/// Relay-assigned identifier for a posted envelope.
pub type MessageId = u64;

/// One envelope pulled from the relay.
#[derive(Debug, Clone)]
pub struct RelayDelivery {
    /// Sender the relay attributes the envelope to.
    pub sender: UserId,
    /// Opaque envelope bytes.
    pub envelope: Bytes,
    /// Relay arrival timestamp, milliseconds.
    pub arrival_ms: u64,
    /// Per-mailbox cursor; pass the highest seen back to `pull`.
    pub cursor: u64,
}

/// Store-and-forward relay interface.
///
/// Delivery is at-least-once: implementations may duplicate and reorder.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Post an envelope to a recipient's mailbox.
    async fn post(
        &self,
        from: &UserId,
        to: &UserId,
        envelope: Bytes,
    ) -> Result<MessageId, ProtocolError>;

    /// Pull deliveries with a cursor greater than `since`, in order.
    async fn pull(&self, user: &UserId, since: u64)
    -> Result<Vec<RelayDelivery>, ProtocolError>;
}

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before the error is surfaced.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff: Duration::from_millis(100) }
    }
}

/// Drive `call` under the retry policy. Fatal errors surface immediately;
/// transient ones are retried until the attempts run out.
pub(crate) async fn with_retry<E, T, F, Fut>(
    env: &E,
    policy: RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, ProtocolError>
where
    E: Environment,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProtocolError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_fatal() || attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                tracing::warn!(operation, attempt, error = %err, "transient failure, backing off");
                env.sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            },
        }
    }
}

#[derive(Default)]
struct RelayInner {
    mailboxes: HashMap<UserId, Vec<RelayDelivery>>,
    next_id: MessageId,
    clock_ms: u64,
}

/// In-process relay for tests and simulation.
///
/// Keeps every delivery so pulling from an old cursor redelivers, which is
/// exactly the at-least-once behavior the ratchet must absorb. Post faults
/// can be injected to exercise the retry path.
#[derive(Default)]
pub struct InMemoryRelay {
    inner: tokio::sync::Mutex<RelayInner>,
    post_faults: AtomicU32,
}

impl InMemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` posts with a transport error.
    pub fn inject_post_faults(&self, count: u32) {
        self.post_faults.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayTransport for InMemoryRelay {
    async fn post(
        &self,
        from: &UserId,
        to: &UserId,
        envelope: Bytes,
    ) -> Result<MessageId, ProtocolError> {
        if self
            .post_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProtocolError::Transport { reason: "injected relay fault".to_string() });
        }

        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        inner.clock_ms += 1;
        let message_id = inner.next_id;
        let arrival_ms = inner.clock_ms;

        let mailbox = inner.mailboxes.entry(to.clone()).or_default();
        let cursor = mailbox.len() as u64 + 1;
        mailbox.push(RelayDelivery { sender: from.clone(), envelope, arrival_ms, cursor });

        Ok(message_id)
    }

    async fn pull(
        &self,
        user: &UserId,
        since: u64,
    ) -> Result<Vec<RelayDelivery>, ProtocolError> {
        let inner = self.inner.lock().await;
        let deliveries = inner
            .mailboxes
            .get(user)
            .map(|mailbox| {
                mailbox.iter().filter(|delivery| delivery.cursor > since).cloned().collect()
            })
            .unwrap_or_default();
        Ok(deliveries)
    }
}
