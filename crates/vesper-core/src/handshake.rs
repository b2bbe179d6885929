//! X3DH-style asynchronous handshake.
//!
//! Derives the initial shared secret for a pair without requiring both
//! parties online: the initiator works from the responder's published
//! bundle, the responder later mirrors the computation from the handshake
//! section the initiator attaches to its first envelopes.
//!
//! DH inputs (initiator's view):
//!
//! ```text
//! DH1 = DH(identity,  responder signed prekey)
//! DH2 = DH(ephemeral, responder identity)
//! DH3 = DH(ephemeral, responder signed prekey)
//! DH4 = DH(ephemeral, responder one-time prekey)   // when allocated
//! ```
//!
//! The initiator immediately performs its first sending ratchet against the
//! responder's signed prekey, so its first envelope already rides a chain
//! the responder can open with one DH ratchet step.

use std::collections::VecDeque;

use ed25519_dalek::{Signature, VerifyingKey};
use vesper_crypto::{derive_handshake_secret, derive_root, dh, public_key};
use vesper_proto::{HandshakeHeader, PreKeyBundle, SIGNATURE_SIZE};
use zeroize::Zeroize;

use crate::{
    env::Environment,
    error::ProtocolError,
    identity::UserId,
    keystore::KeyMaterialStore,
    session::{ChainState, MAX_CACHED_KEYS, SessionState, SkippedKeyCache},
};

/// Run the initiator side of the handshake against a fetched bundle.
///
/// # Errors
///
/// - `Integrity` if the signed prekey signature does not verify; the
///   handshake must not proceed past a tampered bundle.
/// - `Validation` if the local party has no identity in `keys`.
///
/// A bundle without a one-time prekey is accepted: DH4 is simply omitted,
/// which weakens but does not break the agreement.
pub fn initiate<E: Environment>(
    env: &E,
    keys: &KeyMaterialStore,
    local: &UserId,
    remote: &UserId,
    bundle: &PreKeyBundle,
) -> Result<SessionState, ProtocolError> {
    verify_bundle(bundle)?;

    let mut identity_secret = keys.identity_agreement_secret(local)?;
    let mut ephemeral_secret: [u8; 32] = env.random_array();

    let mut dh1 = dh(&identity_secret, &bundle.signed_prekey);
    let mut dh2 = dh(&ephemeral_secret, &bundle.identity_agreement_key);
    let mut dh3 = dh(&ephemeral_secret, &bundle.signed_prekey);
    let mut dh4 = bundle.one_time_prekey.as_ref().map(|otp| dh(&ephemeral_secret, &otp.key));

    let mut shared = derive_handshake_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    // First sending ratchet: fresh keypair against the signed prekey.
    let ratchet_secret: [u8; 32] = env.random_array();
    let ratchet_public = public_key(&ratchet_secret);
    let mut dh_send = dh(&ratchet_secret, &bundle.signed_prekey);
    let (root_key, sending_key) = derive_root(&shared, &dh_send)?;

    let header = HandshakeHeader {
        identity_key: public_key(&identity_secret),
        ephemeral_key: public_key(&ephemeral_secret),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|otp| otp.id),
    };

    identity_secret.zeroize();
    ephemeral_secret.zeroize();
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(dh4) = &mut dh4 {
        dh4.zeroize();
    }
    shared.zeroize();
    dh_send.zeroize();

    tracing::debug!(
        local = %local,
        remote = %remote,
        one_time = header.one_time_prekey_id.is_some(),
        "initiated handshake"
    );

    Ok(SessionState {
        local: local.clone(),
        remote: remote.clone(),
        root_key,
        sending: Some(ChainState { chain_key: sending_key, next_counter: 0 }),
        previous_sending_len: 0,
        ratchet_secret,
        ratchet_public,
        remote_ratchet: Some(bundle.signed_prekey),
        receiving: VecDeque::new(),
        skipped: SkippedKeyCache::new(MAX_CACHED_KEYS),
        pending_handshake: Some(header),
    })
}

/// Run the responder side from a received handshake section.
///
/// Consumes the named one-time prekey from the local pool; a second
/// envelope naming the same id fails `Validation`, which is what enforces
/// the consume-exactly-once invariant.
///
/// The returned session has no chains yet: the first decrypt of the
/// initiator's envelope performs the initial DH ratchet.
pub fn respond(
    keys: &KeyMaterialStore,
    local: &UserId,
    remote: &UserId,
    header: &HandshakeHeader,
) -> Result<SessionState, ProtocolError> {
    let signed_secret = keys.signed_prekey_secret(local, header.signed_prekey_id)?;
    let mut identity_secret = keys.identity_agreement_secret(local)?;

    let mut dh1 = dh(&signed_secret, &header.identity_key);
    let mut dh2 = dh(&identity_secret, &header.ephemeral_key);
    let mut dh3 = dh(&signed_secret, &header.ephemeral_key);
    let mut dh4 = match header.one_time_prekey_id {
        Some(id) => {
            let one_time = keys.take_one_time(local, id)?;
            Some(dh(&one_time.secret, &header.ephemeral_key))
        },
        None => None,
    };

    let shared = derive_handshake_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    identity_secret.zeroize();
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(dh4) = &mut dh4 {
        dh4.zeroize();
    }

    tracing::debug!(
        local = %local,
        remote = %remote,
        one_time = header.one_time_prekey_id.is_some(),
        "responded to handshake"
    );

    Ok(SessionState {
        local: local.clone(),
        remote: remote.clone(),
        root_key: shared,
        sending: None,
        previous_sending_len: 0,
        ratchet_public: public_key(&signed_secret),
        ratchet_secret: signed_secret,
        remote_ratchet: None,
        receiving: VecDeque::new(),
        skipped: SkippedKeyCache::new(MAX_CACHED_KEYS),
        pending_handshake: None,
    })
}

/// Verify the bundle's signed prekey signature against its identity key.
fn verify_bundle(bundle: &PreKeyBundle) -> Result<(), ProtocolError> {
    let verifying = VerifyingKey::from_bytes(&bundle.identity_signing_key).map_err(|_| {
        ProtocolError::Integrity { reason: "bundle identity signing key is invalid".to_string() }
    })?;

    let signature_bytes: [u8; SIGNATURE_SIZE] =
        bundle.signed_prekey_signature.as_slice().try_into().map_err(|_| {
            ProtocolError::Integrity {
                reason: format!("signed prekey signature must be {SIGNATURE_SIZE} bytes"),
            }
        })?;
    let signature = Signature::from_bytes(&signature_bytes);

    verifying.verify_strict(&bundle.signed_prekey, &signature).map_err(|_| {
        ProtocolError::Integrity {
            reason: "signed prekey signature verification failed".to_string(),
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::env::test_support::TestEnv;

    fn party(env: &TestEnv, name: &str) -> (KeyMaterialStore, UserId) {
        let user = UserId::parse(name).unwrap();
        let keys = KeyMaterialStore::new();
        keys.generate_identity(env, &user).unwrap();
        (keys, user)
    }

    #[test]
    fn initiator_and_responder_derive_matching_state() {
        let env = TestEnv::seeded(10);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let bundle = bob_keys.allocate_bundle(&bob).unwrap();
        let alice_session = initiate(&env, &alice_keys, &alice, &bob, &bundle).unwrap();

        let header = alice_session.pending_handshake.unwrap();
        let bob_session = respond(&bob_keys, &bob, &alice, &header).unwrap();

        // Bob's first DH ratchet step against Alice's ratchet key must land
        // on exactly the root and chain Alice derived at initiation.
        let dh_out = dh(&bob_session.ratchet_secret, &alice_session.ratchet_public);
        let (root, chain) = derive_root(&bob_session.root_key, &dh_out).unwrap();
        assert_eq!(root, alice_session.root_key);
        assert_eq!(chain, alice_session.sending.as_ref().unwrap().chain_key);
    }

    #[test]
    fn tampered_signature_fails_integrity() {
        let env = TestEnv::seeded(11);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let mut bundle = bob_keys.allocate_bundle(&bob).unwrap();
        bundle.signed_prekey_signature[0] ^= 0x01;

        let result = initiate(&env, &alice_keys, &alice, &bob, &bundle);
        assert!(matches!(result, Err(ProtocolError::Integrity { .. })));
    }

    #[test]
    fn truncated_signature_fails_integrity() {
        let env = TestEnv::seeded(12);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let mut bundle = bob_keys.allocate_bundle(&bob).unwrap();
        bundle.signed_prekey_signature.truncate(32);

        let result = initiate(&env, &alice_keys, &alice, &bob, &bundle);
        assert!(matches!(result, Err(ProtocolError::Integrity { .. })));
    }

    #[test]
    fn substituted_signed_prekey_fails_integrity() {
        let env = TestEnv::seeded(13);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let mut bundle = bob_keys.allocate_bundle(&bob).unwrap();
        bundle.signed_prekey = public_key(&[0x42; 32]);

        let result = initiate(&env, &alice_keys, &alice, &bob, &bundle);
        assert!(matches!(result, Err(ProtocolError::Integrity { .. })));
    }

    #[test]
    fn responder_rejects_unknown_signed_prekey_id() {
        let env = TestEnv::seeded(14);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let bundle = bob_keys.allocate_bundle(&bob).unwrap();
        let session = initiate(&env, &alice_keys, &alice, &bob, &bundle).unwrap();
        let mut header = session.pending_handshake.unwrap();
        header.signed_prekey_id = 777;

        let result = respond(&bob_keys, &bob, &alice, &header);
        assert!(matches!(result, Err(ProtocolError::Validation { .. })));
    }

    #[test]
    fn responder_rejects_reused_one_time_prekey() {
        let env = TestEnv::seeded(15);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let bundle = bob_keys.allocate_bundle(&bob).unwrap();
        let session = initiate(&env, &alice_keys, &alice, &bob, &bundle).unwrap();
        let header = session.pending_handshake.unwrap();

        respond(&bob_keys, &bob, &alice, &header).unwrap();
        let second = respond(&bob_keys, &bob, &alice, &header);
        assert!(matches!(second, Err(ProtocolError::Validation { .. })));
    }

    #[test]
    fn degraded_handshake_without_one_time_prekey() {
        let env = TestEnv::seeded(16);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        let bundle = bob_keys.bundle_without_one_time(&bob).unwrap();
        let alice_session = initiate(&env, &alice_keys, &alice, &bob, &bundle).unwrap();

        let header = alice_session.pending_handshake.unwrap();
        assert_eq!(header.one_time_prekey_id, None);

        let bob_session = respond(&bob_keys, &bob, &alice, &header).unwrap();
        let dh_out = dh(&bob_session.ratchet_secret, &alice_session.ratchet_public);
        let (root, _) = derive_root(&bob_session.root_key, &dh_out).unwrap();
        assert_eq!(root, alice_session.root_key);
    }

    #[test]
    fn handshake_after_rotation_resolves_previous_prekey() {
        let env = TestEnv::seeded(17);
        let (alice_keys, alice) = party(&env, "alice");
        let (bob_keys, bob) = party(&env, "bob");

        // Alice fetches a bundle, then Bob rotates before her first message
        // lands. The retained previous prekey keeps the handshake alive.
        let bundle = bob_keys.allocate_bundle(&bob).unwrap();
        let session = initiate(&env, &alice_keys, &alice, &bob, &bundle).unwrap();
        bob_keys.rotate_signed_prekey(&env, &bob).unwrap();

        let header = session.pending_handshake.unwrap();
        assert!(respond(&bob_keys, &bob, &alice, &header).is_ok());
    }
}
