//! Prekey bundle exchange.
//!
//! The directory is the external collaborator an initiator asks for a
//! peer's bundle. Fetching is consuming: each served bundle carries a
//! one-time prekey removed from the peer's pool, until the pool runs dry
//! and the directory degrades to bundles without one.

use std::sync::Arc;

use async_trait::async_trait;
use vesper_proto::PreKeyBundle;

use crate::{error::ProtocolError, identity::UserId, keystore::KeyMaterialStore};

/// Bundle fetch interface.
#[async_trait]
pub trait BundleDirectory: Send + Sync {
    /// Fetch a bundle for `user`, or `None` when the user is unknown.
    async fn fetch(&self, user: &UserId) -> Result<Option<PreKeyBundle>, ProtocolError>;
}

/// Directory backed directly by a key material store.
///
/// Models the real directory service in tests and simulation: allocation
/// consumes from the pool atomically, and `KeyPoolExhausted` is absorbed
/// here by serving a degraded bundle, per the error-handling contract.
pub struct InMemoryDirectory {
    keys: Arc<KeyMaterialStore>,
}

impl InMemoryDirectory {
    /// Wrap a key material store.
    pub fn new(keys: Arc<KeyMaterialStore>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl BundleDirectory for InMemoryDirectory {
    async fn fetch(&self, user: &UserId) -> Result<Option<PreKeyBundle>, ProtocolError> {
        if !self.keys.contains(user) {
            return Ok(None);
        }

        match self.keys.allocate_bundle(user) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(ProtocolError::KeyPoolExhausted { .. }) => {
                tracing::warn!(user = %user, "one-time prekey pool exhausted, serving degraded bundle");
                self.keys.bundle_without_one_time(user).map(Some)
            },
            Err(err) => Err(err),
        }
    }
}
