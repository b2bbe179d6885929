//! Session persistence.
//!
//! The backing store is an external collaborator that sees only opaque
//! serialized bytes keyed by the ordered (local, remote) pair. The ratchet
//! engine's caller is responsible for the load-mutate-save discipline: one
//! logical unit per operation, committed only after the operation succeeds.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::ProtocolError, identity::UserId, session::SessionState};

/// Session persistence interface.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session for an ordered pair, if one exists.
    async fn load(
        &self,
        local: &UserId,
        remote: &UserId,
    ) -> Result<Option<SessionState>, ProtocolError>;

    /// Persist the session, replacing any previous state for its pair.
    async fn save(&self, session: &SessionState) -> Result<(), ProtocolError>;

    /// Remove the session for a pair. Explicit teardown is the only path
    /// that deletes ratchet state; removing an absent session is a no-op.
    async fn delete(&self, local: &UserId, remote: &UserId) -> Result<(), ProtocolError>;
}

/// In-memory store holding CBOR-serialized sessions.
///
/// Serializing through the same path a database-backed store would use
/// keeps the byte-oriented contract honest: what comes back out is a
/// deserialized copy, never a shared reference.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: tokio::sync::Mutex<HashMap<(UserId, UserId), Bytes>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(
        &self,
        local: &UserId,
        remote: &UserId,
    ) -> Result<Option<SessionState>, ProtocolError> {
        let sessions = self.sessions.lock().await;
        let Some(bytes) = sessions.get(&(local.clone(), remote.clone())) else {
            return Ok(None);
        };

        let session = ciborium::de::from_reader(bytes.as_ref()).map_err(|e| {
            ProtocolError::Storage { reason: format!("session deserialization failed: {e}") }
        })?;
        Ok(Some(session))
    }

    async fn save(&self, session: &SessionState) -> Result<(), ProtocolError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(session, &mut buf).map_err(|e| ProtocolError::Storage {
            reason: format!("session serialization failed: {e}"),
        })?;

        let mut sessions = self.sessions.lock().await;
        sessions.insert((session.local().clone(), session.remote().clone()), Bytes::from(buf));
        Ok(())
    }

    async fn delete(&self, local: &UserId, remote: &UserId) -> Result<(), ProtocolError> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&(local.clone(), remote.clone()));
        Ok(())
    }
}
