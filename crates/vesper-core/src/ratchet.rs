//! Double-ratchet encryption engine.
//!
//! Two ratchets compose per session:
//!
//! - the symmetric ratchet advances a chain key per message, deriving a
//!   single-use message key (forward secrecy within an epoch),
//! - the DH ratchet opens a new epoch whenever an envelope arrives under a
//!   ratchet public key we have not seen, mixing fresh DH output into the
//!   root key (post-compromise security across epochs).
//!
//! Decryption stages every mutation on a copy of the session and commits
//! only after the AEAD tag verifies, so authentication failures, replay
//! rejections, and skip-bound violations leave no trace in chain state.

use vesper_crypto::{advance_chain, derive_root, dh, open, public_key, seal};
use vesper_proto::{Envelope, EnvelopeHeader, NONCE_SIZE};

use crate::{
    env::Environment,
    error::ProtocolError,
    session::{ChainState, MAX_SKIP, SessionState},
};

/// Encrypt a message on the session's sending chain.
///
/// Advances the chain key (the previous value is unrecoverable) and bumps
/// the counter only after the AEAD seal succeeds. The serialized header is
/// the associated data, and the handshake section rides along while the
/// session still has one pending.
pub fn encrypt<E: Environment>(
    env: &E,
    session: &mut SessionState,
    plaintext: &[u8],
) -> Result<Envelope, ProtocolError> {
    let Some(sending) = session.sending.as_ref() else {
        return Err(ProtocolError::Validation {
            reason: "session has no sending chain yet".to_string(),
        });
    };

    let (next_chain, message_key) = advance_chain(&sending.chain_key)?;

    let header = EnvelopeHeader {
        ratchet_key: session.ratchet_public,
        previous_chain_len: session.previous_sending_len,
        counter: sending.next_counter,
        handshake: session.pending_handshake,
    };
    let aad = header.encode();
    let nonce: [u8; NONCE_SIZE] = env.random_array();
    let ciphertext = seal(&message_key, &nonce, plaintext, &aad)?;

    if let Some(sending) = session.sending.as_mut() {
        sending.chain_key = next_chain;
        sending.next_counter += 1;
    }

    Ok(Envelope { header, nonce, ciphertext })
}

/// Decrypt an envelope, resolving the right receiving chain.
///
/// Resolution order: the skipped-key cache, then a known receiving chain
/// (advancing through any bounded gap), with a DH ratchet step first when
/// the sender's ratchet key is new.
///
/// # Errors
///
/// - `ReplayDetected` for a counter the chain already consumed that is not
///   in the cache.
/// - `SkippedTooMany` for gaps beyond `MAX_SKIP`.
/// - `AuthenticationFailure` on tag mismatch.
///
/// All failures are side-effect free: the session is untouched unless the
/// envelope authenticated.
pub fn decrypt<E: Environment>(
    env: &E,
    session: &mut SessionState,
    envelope: &Envelope,
) -> Result<Vec<u8>, ProtocolError> {
    let mut staged = session.clone();
    let plaintext = decrypt_staged(env, &mut staged, envelope)?;
    *session = staged;
    Ok(plaintext)
}

fn decrypt_staged<E: Environment>(
    env: &E,
    staged: &mut SessionState,
    envelope: &Envelope,
) -> Result<Vec<u8>, ProtocolError> {
    let header = &envelope.header;
    let aad = header.encode();

    // An out-of-order message whose key was derived earlier: serve it from
    // the cache and consume the key.
    if let Some(message_key) = staged.skipped.take(&header.ratchet_key, header.counter) {
        let plaintext = open(&message_key, &envelope.nonce, &envelope.ciphertext, &aad)?;
        staged.pending_handshake = None;
        return Ok(plaintext);
    }

    if staged.receiving_index(&header.ratchet_key).is_none() {
        dh_ratchet(env, staged, header)?;
    }
    let Some(index) = staged.receiving_index(&header.ratchet_key) else {
        return Err(ProtocolError::Integrity {
            reason: "receiving chain missing after ratchet step".to_string(),
        });
    };

    let mut chain = staged.receiving[index].chain.clone();

    // Below the chain cursor and not cached: already consumed or invented.
    if header.counter < chain.next_counter {
        return Err(ProtocolError::ReplayDetected { counter: header.counter });
    }
    let gap = header.counter - chain.next_counter;
    if gap > MAX_SKIP {
        return Err(ProtocolError::SkippedTooMany { requested: gap, limit: MAX_SKIP });
    }

    let mut derived = Vec::with_capacity(gap as usize);
    while chain.next_counter < header.counter {
        let (next_chain, skipped_key) = advance_chain(&chain.chain_key)?;
        derived.push((chain.next_counter, skipped_key));
        chain.chain_key = next_chain;
        chain.next_counter += 1;
    }

    let (next_chain, message_key) = advance_chain(&chain.chain_key)?;
    let plaintext = open(&message_key, &envelope.nonce, &envelope.ciphertext, &aad)?;

    chain.chain_key = next_chain;
    chain.next_counter += 1;
    for (counter, skipped_key) in derived {
        staged.skipped.insert(header.ratchet_key, counter, skipped_key);
    }
    staged.receiving[index].chain = chain;
    staged.pending_handshake = None;

    Ok(plaintext)
}

/// Open a new epoch for a previously unseen remote ratchet key.
fn dh_ratchet<E: Environment>(
    env: &E,
    staged: &mut SessionState,
    header: &EnvelopeHeader,
) -> Result<(), ProtocolError> {
    // Cache the undelivered tail of the closing chain, up to the sender's
    // declared previous-chain length, before it stops advancing.
    if let Some(active) = staged.receiving.back() {
        let chain_id = active.remote_key;
        let mut chain = active.chain.clone();

        if header.previous_chain_len > chain.next_counter {
            let gap = header.previous_chain_len - chain.next_counter;
            if gap > MAX_SKIP {
                return Err(ProtocolError::SkippedTooMany { requested: gap, limit: MAX_SKIP });
            }
            while chain.next_counter < header.previous_chain_len {
                let (next_chain, skipped_key) = advance_chain(&chain.chain_key)?;
                staged.skipped.insert(chain_id, chain.next_counter, skipped_key);
                chain.chain_key = next_chain;
                chain.next_counter += 1;
            }
            if let Some(active) = staged.receiving.back_mut() {
                active.chain = chain;
            }
        }
    }

    // Receiving side of the step: the sender's new key against our current
    // ratchet keypair.
    let dh_receive = dh(&staged.ratchet_secret, &header.ratchet_key);
    let (root_key, receiving_key) = derive_root(&staged.root_key, &dh_receive)?;
    staged.root_key = root_key;
    staged.push_receiving_chain(
        header.ratchet_key,
        ChainState { chain_key: receiving_key, next_counter: 0 },
    );
    staged.remote_ratchet = Some(header.ratchet_key);

    // Sending side: fresh keypair, new epoch for our own outgoing chain.
    staged.previous_sending_len = staged.sending.as_ref().map_or(0, |chain| chain.next_counter);
    let ratchet_secret: [u8; 32] = env.random_array();
    let ratchet_public = public_key(&ratchet_secret);
    let dh_send = dh(&ratchet_secret, &header.ratchet_key);
    let (root_key, sending_key) = derive_root(&staged.root_key, &dh_send)?;
    staged.root_key = root_key;
    staged.sending = Some(ChainState { chain_key: sending_key, next_counter: 0 });
    staged.ratchet_secret = ratchet_secret;
    staged.ratchet_public = ratchet_public;

    tracing::debug!(local = %staged.local, remote = %staged.remote, "dh ratchet step");
    Ok(())
}
