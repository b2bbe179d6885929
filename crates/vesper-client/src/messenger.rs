//! Messenger: the send/receive control flow.
//!
//! Wires the protocol core to its collaborators: bundle directory, session
//! store, and relay. Every operation on a (local, remote) pair runs under
//! that pair's async lock, so two concurrent sends or receives never
//! interleave their chain-key advances; operations on different pairs
//! proceed in parallel.
//!
//! Session state is committed to the store only after the operation fully
//! succeeded. A transport failure or a caller timeout cancels before the
//! save, rolling the chain advance back; dropping the in-flight future
//! releases the pair lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use vesper_core::{
    BundleDirectory, Environment, IdentityPublic, KeyMaterialStore, ProtocolError, SessionState,
    SessionStore, UserId, handshake, ratchet,
};
use vesper_proto::Envelope;

use crate::relay::{MessageId, RelayDelivery, RelayTransport, RetryPolicy, with_retry};

/// Metadata returned from a send.
///
/// This is the entire outward surface of a send: plaintext never crosses
/// this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Relay-assigned message identifier.
    pub message_id: MessageId,
    /// Local timestamp of the send, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Length of the posted ciphertext (plaintext + AEAD tag).
    pub ciphertext_len: usize,
}

/// One processed inbound envelope.
///
/// Per-envelope failures are carried in `outcome` unchanged rather than
/// aborting the whole pull: a poisoned envelope must not wedge the mailbox.
pub struct Inbound {
    /// Sender the relay attributed the envelope to.
    pub sender: UserId,
    /// Relay arrival timestamp, milliseconds.
    pub arrival_ms: u64,
    /// Decrypted plaintext, or the error that envelope produced.
    pub outcome: Result<Vec<u8>, ProtocolError>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match &self.outcome {
            Ok(plaintext) => format!("Ok(<{} bytes>)", plaintext.len()),
            Err(err) => format!("Err({err})"),
        };
        f.debug_struct("Inbound")
            .field("sender", &self.sender)
            .field("arrival_ms", &self.arrival_ms)
            .field("outcome", &outcome)
            .finish()
    }
}

/// Per-user messaging endpoint.
pub struct Messenger<E: Environment> {
    env: E,
    local: UserId,
    keys: Arc<KeyMaterialStore>,
    directory: Arc<dyn BundleDirectory>,
    sessions: Arc<dyn SessionStore>,
    relay: Arc<dyn RelayTransport>,
    retry: RetryPolicy,
    pair_locks: StdMutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    cursor: tokio::sync::Mutex<u64>,
}

impl<E: Environment> Messenger<E> {
    /// Create a messenger for `local` over the given collaborators.
    pub fn new(
        env: E,
        local: UserId,
        keys: Arc<KeyMaterialStore>,
        directory: Arc<dyn BundleDirectory>,
        sessions: Arc<dyn SessionStore>,
        relay: Arc<dyn RelayTransport>,
    ) -> Self {
        Self {
            env,
            local,
            keys,
            directory,
            sessions,
            relay,
            retry: RetryPolicy::default(),
            pair_locks: StdMutex::new(HashMap::new()),
            cursor: tokio::sync::Mutex::new(0),
        }
    }

    /// Override the transport retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The local user this messenger operates as.
    pub fn local(&self) -> &UserId {
        &self.local
    }

    /// Create identity and prekeys for the local user.
    pub fn register(&self) -> Result<IdentityPublic, ProtocolError> {
        self.keys.generate_identity(&self.env, &self.local)
    }

    /// Explicitly establish a session with `remote`.
    ///
    /// # Errors
    ///
    /// Returns `SessionAlreadyExists` if one exists; use [`Self::rekey`]
    /// to deliberately replace it.
    pub async fn establish(&self, remote: &UserId) -> Result<(), ProtocolError> {
        let lock = self.pair_lock(remote);
        let _guard = lock.lock().await;

        if self.sessions.load(&self.local, remote).await?.is_some() {
            return Err(ProtocolError::SessionAlreadyExists {
                local: self.local.clone(),
                remote: remote.clone(),
            });
        }

        let session = self.start_session(remote).await?;
        self.sessions.save(&session).await
    }

    /// Encrypt and post one message, running the handshake first when no
    /// session exists for the pair.
    pub async fn send(
        &self,
        remote: &UserId,
        plaintext: &[u8],
    ) -> Result<SendReceipt, ProtocolError> {
        let lock = self.pair_lock(remote);
        let _guard = lock.lock().await;

        let mut session = match self.sessions.load(&self.local, remote).await? {
            Some(session) => session,
            None => self.start_session(remote).await?,
        };

        let envelope = ratchet::encrypt(&self.env, &mut session, plaintext)?;
        let ciphertext_len = envelope.ciphertext.len();
        let bytes = Bytes::from(envelope.encode());

        let relay = Arc::clone(&self.relay);
        let from = self.local.clone();
        let to = remote.clone();
        let message_id = with_retry(&self.env, self.retry, "relay post", move || {
            let relay = Arc::clone(&relay);
            let from = from.clone();
            let to = to.clone();
            let bytes = bytes.clone();
            async move { relay.post(&from, &to, bytes).await }
        })
        .await?;

        // Chain state commits only once the relay accepted the envelope; a
        // transport failure above never reaches the save, so the advance
        // rolls back with the discarded session copy.
        self.sessions.save(&session).await?;

        tracing::debug!(remote = %remote, message_id, ciphertext_len, "sent message");
        Ok(SendReceipt { message_id, timestamp_ms: self.env.unix_millis(), ciphertext_len })
    }

    /// [`Self::send`] bounded by a caller-supplied timeout.
    ///
    /// Cancellation releases the pair lock and commits nothing.
    pub async fn send_with_timeout(
        &self,
        remote: &UserId,
        plaintext: &[u8],
        timeout: Duration,
    ) -> Result<SendReceipt, ProtocolError> {
        tokio::time::timeout(timeout, self.send(remote, plaintext)).await.map_err(|_| {
            ProtocolError::Transport { reason: format!("send timed out after {timeout:?}") }
        })?
    }

    /// Pull and decrypt everything new in the local mailbox.
    ///
    /// Every envelope yields an [`Inbound`]; per-envelope errors surface in
    /// its `outcome` unchanged. The cursor advances past failures so one
    /// bad envelope cannot block later ones.
    pub async fn receive(&self) -> Result<Vec<Inbound>, ProtocolError> {
        let since = *self.cursor.lock().await;

        let relay = Arc::clone(&self.relay);
        let user = self.local.clone();
        let deliveries = with_retry(&self.env, self.retry, "relay pull", move || {
            let relay = Arc::clone(&relay);
            let user = user.clone();
            async move { relay.pull(&user, since).await }
        })
        .await?;

        let mut inbound = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let outcome = self.process_delivery(&delivery).await;
            if let Err(err) = &outcome {
                tracing::warn!(sender = %delivery.sender, error = %err, "envelope rejected");
            }

            let mut cursor = self.cursor.lock().await;
            *cursor = (*cursor).max(delivery.cursor);
            drop(cursor);

            inbound.push(Inbound {
                sender: delivery.sender,
                arrival_ms: delivery.arrival_ms,
                outcome,
            });
        }
        Ok(inbound)
    }

    /// [`Self::receive`] bounded by a caller-supplied timeout.
    pub async fn receive_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<Inbound>, ProtocolError> {
        tokio::time::timeout(timeout, self.receive()).await.map_err(|_| {
            ProtocolError::Transport { reason: format!("receive timed out after {timeout:?}") }
        })?
    }

    /// Replace the session with a fresh handshake. The only sanctioned way
    /// around `SessionAlreadyExists`.
    pub async fn rekey(&self, remote: &UserId) -> Result<(), ProtocolError> {
        let lock = self.pair_lock(remote);
        let _guard = lock.lock().await;

        if self.sessions.load(&self.local, remote).await?.is_none() {
            return Err(ProtocolError::SessionNotFound {
                local: self.local.clone(),
                remote: remote.clone(),
            });
        }

        let session = self.start_session(remote).await?;
        self.sessions.save(&session).await?;
        tracing::debug!(remote = %remote, "re-keyed session");
        Ok(())
    }

    /// Explicit session teardown for a pair.
    pub async fn teardown(&self, remote: &UserId) -> Result<(), ProtocolError> {
        let lock = self.pair_lock(remote);
        let _guard = lock.lock().await;
        self.sessions.delete(&self.local, remote).await
    }

    /// Fetch the peer's bundle and run the initiator handshake.
    async fn start_session(&self, remote: &UserId) -> Result<SessionState, ProtocolError> {
        let directory = Arc::clone(&self.directory);
        let user = remote.clone();
        let bundle = with_retry(&self.env, self.retry, "bundle fetch", move || {
            let directory = Arc::clone(&directory);
            let user = user.clone();
            async move { directory.fetch(&user).await }
        })
        .await?
        .ok_or_else(|| ProtocolError::PeerUnavailable { user: remote.clone() })?;

        handshake::initiate(&self.env, &self.keys, &self.local, remote, &bundle)
    }

    async fn process_delivery(&self, delivery: &RelayDelivery) -> Result<Vec<u8>, ProtocolError> {
        let envelope = Envelope::decode(&delivery.envelope)?;
        let sender = &delivery.sender;

        let lock = self.pair_lock(sender);
        let _guard = lock.lock().await;

        match self.sessions.load(&self.local, sender).await? {
            Some(mut session) => match ratchet::decrypt(&self.env, &mut session, &envelope) {
                Ok(plaintext) => {
                    self.sessions.save(&session).await?;
                    Ok(plaintext)
                },
                Err(original) => self.retry_as_fresh_session(sender, &envelope, original).await,
            },
            None => {
                let Some(header) = envelope.header.handshake else {
                    return Err(ProtocolError::SessionNotFound {
                        local: self.local.clone(),
                        remote: sender.clone(),
                    });
                };
                let mut session = handshake::respond(&self.keys, &self.local, sender, &header)?;
                let plaintext = ratchet::decrypt(&self.env, &mut session, &envelope)?;
                self.sessions.save(&session).await?;
                Ok(plaintext)
            },
        }
    }

    /// A decrypt failure on an envelope that still carries a handshake
    /// section may mean the peer re-keyed: rebuild the session from the
    /// section and try once more. When the rebuild itself is impossible
    /// (a replayed first envelope names a consumed one-time prekey, for
    /// instance), the original failure is surfaced instead.
    async fn retry_as_fresh_session(
        &self,
        sender: &UserId,
        envelope: &Envelope,
        original: ProtocolError,
    ) -> Result<Vec<u8>, ProtocolError> {
        let Some(header) = envelope.header.handshake else {
            return Err(original);
        };
        let Ok(mut session) = handshake::respond(&self.keys, &self.local, sender, &header) else {
            return Err(original);
        };

        let plaintext = ratchet::decrypt(&self.env, &mut session, envelope)?;
        tracing::warn!(sender = %sender, "peer re-keyed, session rebuilt from handshake envelope");
        self.sessions.save(&session).await?;
        Ok(plaintext)
    }

    fn pair_lock(&self, remote: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.pair_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(remote.clone()).or_default())
    }
}
