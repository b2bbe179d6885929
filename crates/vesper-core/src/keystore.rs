//! Key material store.
//!
//! Owns every party's long-term identity keypair, current (and one
//! previous) signed prekey, and the pool of one-time prekeys. All pool
//! mutation happens under a single lock, so one-time prekey allocation is
//! atomic with respect to concurrent handshakes: no two bundles ever carry
//! the same one-time prekey.
//!
//! The identity seed drives both key algorithms, Ed25519 for bundle
//! signatures and X25519 for the handshake DH, so a party publishes one
//! identity with two public encodings.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use ed25519_dalek::{Signer, SigningKey};
use vesper_proto::bundle::{OneTimePreKeyPublic, PreKeyBundle};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{env::Environment, error::ProtocolError, identity::UserId};

/// One-time prekeys created alongside a fresh identity.
pub const DEFAULT_ONE_TIME_POOL: usize = 16;

/// Public half of a party's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityPublic {
    /// Ed25519 public key; verifies signed-prekey signatures.
    pub signing_key: [u8; 32],
    /// X25519 public key; participates in the handshake DH.
    pub agreement_key: [u8; 32],
}

/// Long-term identity keypair. Never rotated within a session's lifetime.
#[derive(Zeroize, ZeroizeOnDrop)]
struct IdentityKeyPair {
    seed: [u8; 32],
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair").field("seed", &"<redacted>").finish()
    }
}

impl IdentityKeyPair {
    fn generate<E: Environment>(env: &E) -> Self {
        Self { seed: env.random_array() }
    }

    fn public(&self) -> IdentityPublic {
        IdentityPublic {
            signing_key: SigningKey::from_bytes(&self.seed).verifying_key().to_bytes(),
            agreement_key: vesper_crypto::public_key(&self.seed),
        }
    }

    fn agreement_secret(&self) -> [u8; 32] {
        self.seed
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.seed).sign(message).to_bytes()
    }
}

/// Medium-term prekey, signed by the identity key. Rotation is triggered
/// externally; the previous one stays resolvable for in-flight handshakes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SignedPreKeyPair {
    pub(crate) id: u32,
    pub(crate) secret: [u8; 32],
    pub(crate) public: [u8; 32],
    pub(crate) signature: [u8; 64],
}

impl SignedPreKeyPair {
    fn generate<E: Environment>(env: &E, identity: &IdentityKeyPair, id: u32) -> Self {
        let secret: [u8; 32] = env.random_array();
        let public = vesper_crypto::public_key(&secret);
        let signature = identity.sign(&public);
        Self { id, secret, public, signature }
    }
}

/// Single-use prekey; consumed by exactly one handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct OneTimePreKeyPair {
    pub(crate) id: u32,
    pub(crate) secret: [u8; 32],
    pub(crate) public: [u8; 32],
}

impl OneTimePreKeyPair {
    fn generate<E: Environment>(env: &E, id: u32) -> Self {
        let secret: [u8; 32] = env.random_array();
        let public = vesper_crypto::public_key(&secret);
        Self { id, secret, public }
    }
}

/// Per-party key material.
struct PartyKeys {
    identity: IdentityKeyPair,
    signed: SignedPreKeyPair,
    previous_signed: Option<SignedPreKeyPair>,
    /// Pool available for bundle allocation.
    one_time: BTreeMap<u32, OneTimePreKeyPair>,
    /// Allocated into a bundle; the secret stays resolvable until the
    /// initiator's first envelope consumes it.
    issued_one_time: BTreeMap<u32, OneTimePreKeyPair>,
    next_key_id: u32,
}

impl PartyKeys {
    fn bundle(&self, one_time: Option<&OneTimePreKeyPair>) -> PreKeyBundle {
        let identity = self.identity.public();
        PreKeyBundle {
            identity_signing_key: identity.signing_key,
            identity_agreement_key: identity.agreement_key,
            signed_prekey_id: self.signed.id,
            signed_prekey: self.signed.public,
            signed_prekey_signature: self.signed.signature.to_vec(),
            one_time_prekey: one_time.map(|otp| OneTimePreKeyPublic { id: otp.id, key: otp.public }),
        }
    }
}

/// In-process key material store for any number of local parties.
///
/// An explicit store object injected into every operation; there is no
/// ambient singleton. It performs no network or persistence side effects.
#[derive(Default)]
pub struct KeyMaterialStore {
    parties: Mutex<HashMap<UserId, PartyKeys>>,
}

impl KeyMaterialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn parties(&self) -> MutexGuard<'_, HashMap<UserId, PartyKeys>> {
        self.parties.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create identity, signed prekey, and the initial one-time pool for a
    /// new party.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the party already has an identity.
    pub fn generate_identity<E: Environment>(
        &self,
        env: &E,
        user: &UserId,
    ) -> Result<IdentityPublic, ProtocolError> {
        let mut parties = self.parties();
        if parties.contains_key(user) {
            return Err(ProtocolError::Validation {
                reason: format!("identity already exists for {user}"),
            });
        }

        let identity = IdentityKeyPair::generate(env);
        let signed = SignedPreKeyPair::generate(env, &identity, 1);

        let mut one_time = BTreeMap::new();
        let mut next_key_id = 2;
        for _ in 0..DEFAULT_ONE_TIME_POOL {
            one_time.insert(next_key_id, OneTimePreKeyPair::generate(env, next_key_id));
            next_key_id += 1;
        }

        let public = identity.public();
        parties.insert(
            user.clone(),
            PartyKeys {
                identity,
                signed,
                previous_signed: None,
                one_time,
                issued_one_time: BTreeMap::new(),
                next_key_id,
            },
        );

        tracing::debug!(user = %user, "generated identity");
        Ok(public)
    }

    /// Whether the party has an identity in this store.
    pub fn contains(&self, user: &UserId) -> bool {
        self.parties().contains_key(user)
    }

    /// Public identity of a party.
    pub fn identity_of(&self, user: &UserId) -> Result<IdentityPublic, ProtocolError> {
        let parties = self.parties();
        let party = lookup(&parties, user)?;
        Ok(party.identity.public())
    }

    /// Build a bundle, atomically removing one one-time prekey from the
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns `KeyPoolExhausted` when the pool is empty; callers fall back
    /// to [`Self::bundle_without_one_time`].
    pub fn allocate_bundle(&self, user: &UserId) -> Result<PreKeyBundle, ProtocolError> {
        let mut parties = self.parties();
        let party = lookup_mut(&mut parties, user)?;

        let Some((id, one_time)) = party.one_time.pop_first() else {
            return Err(ProtocolError::KeyPoolExhausted { user: user.clone() });
        };

        let bundle = party.bundle(Some(&one_time));
        party.issued_one_time.insert(id, one_time);
        Ok(bundle)
    }

    /// Build a bundle without consuming a one-time prekey.
    ///
    /// Degraded fallback for an exhausted pool: the resulting handshake
    /// omits DH4.
    pub fn bundle_without_one_time(&self, user: &UserId) -> Result<PreKeyBundle, ProtocolError> {
        let parties = self.parties();
        let party = lookup(&parties, user)?;
        Ok(party.bundle(None))
    }

    /// Replace the signed prekey, retaining the previous one so in-flight
    /// handshakes still resolve. Returns the new prekey id.
    pub fn rotate_signed_prekey<E: Environment>(
        &self,
        env: &E,
        user: &UserId,
    ) -> Result<u32, ProtocolError> {
        let mut parties = self.parties();
        let party = lookup_mut(&mut parties, user)?;

        let id = party.next_key_id;
        party.next_key_id += 1;

        let fresh = SignedPreKeyPair::generate(env, &party.identity, id);
        party.previous_signed = Some(std::mem::replace(&mut party.signed, fresh));

        tracing::debug!(user = %user, id, "rotated signed prekey");
        Ok(id)
    }

    /// Add `count` fresh one-time prekeys to the pool. Returns their ids.
    pub fn replenish_one_time<E: Environment>(
        &self,
        env: &E,
        user: &UserId,
        count: usize,
    ) -> Result<Vec<u32>, ProtocolError> {
        let mut parties = self.parties();
        let party = lookup_mut(&mut parties, user)?;

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = party.next_key_id;
            party.next_key_id += 1;
            party.one_time.insert(id, OneTimePreKeyPair::generate(env, id));
            ids.push(id);
        }
        Ok(ids)
    }

    /// Number of one-time prekeys left in the pool.
    pub fn one_time_remaining(&self, user: &UserId) -> Result<usize, ProtocolError> {
        let parties = self.parties();
        let party = lookup(&parties, user)?;
        Ok(party.one_time.len())
    }

    /// Identity X25519 secret, for the handshake DH computations.
    pub(crate) fn identity_agreement_secret(
        &self,
        user: &UserId,
    ) -> Result<[u8; 32], ProtocolError> {
        let parties = self.parties();
        let party = lookup(&parties, user)?;
        Ok(party.identity.agreement_secret())
    }

    /// Signed prekey secret by id: current or retained previous.
    pub(crate) fn signed_prekey_secret(
        &self,
        user: &UserId,
        id: u32,
    ) -> Result<[u8; 32], ProtocolError> {
        let parties = self.parties();
        let party = lookup(&parties, user)?;

        if party.signed.id == id {
            return Ok(party.signed.secret);
        }
        if let Some(previous) = &party.previous_signed {
            if previous.id == id {
                return Ok(previous.secret);
            }
        }
        Err(ProtocolError::Validation { reason: format!("unknown signed prekey id {id}") })
    }

    /// Remove and return a one-time prekey. A second call with the same id
    /// fails: each one-time prekey is consumed by exactly one handshake.
    pub(crate) fn take_one_time(
        &self,
        user: &UserId,
        id: u32,
    ) -> Result<OneTimePreKeyPair, ProtocolError> {
        let mut parties = self.parties();
        let party = lookup_mut(&mut parties, user)?;

        party
            .issued_one_time
            .remove(&id)
            .or_else(|| party.one_time.remove(&id))
            .ok_or_else(|| ProtocolError::Validation {
                reason: format!("one-time prekey {id} unknown or already consumed"),
            })
    }
}

fn lookup<'a>(
    parties: &'a HashMap<UserId, PartyKeys>,
    user: &UserId,
) -> Result<&'a PartyKeys, ProtocolError> {
    parties
        .get(user)
        .ok_or_else(|| ProtocolError::Validation { reason: format!("unknown user: {user}") })
}

fn lookup_mut<'a>(
    parties: &'a mut HashMap<UserId, PartyKeys>,
    user: &UserId,
) -> Result<&'a mut PartyKeys, ProtocolError> {
    parties
        .get_mut(user)
        .ok_or_else(|| ProtocolError::Validation { reason: format!("unknown user: {user}") })
}
