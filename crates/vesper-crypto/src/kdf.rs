//! Ratchet key derivation.
//!
//! Two KDFs drive the double ratchet:
//!
//! - the root KDF mixes a DH output into the root key at each epoch change
//!   and yields the next chain key,
//! - the chain KDF advances a chain key one step and yields a message key.
//!
//! The chain KDF is one-way: holding a chain key at step N reveals nothing
//! about step N-1, which is where per-message forward secrecy comes from.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::CryptoError;

/// Domain separation for the root KDF.
const ROOT_STEP_INFO: &[u8] = b"vesper ratchet step v1";

/// HMAC seed deriving a message key from a chain key.
const MESSAGE_KEY_SEED: u8 = 0x01;

/// HMAC seed deriving the next chain key from a chain key.
const CHAIN_KEY_SEED: u8 = 0x02;

/// Mix a DH output into the root key.
///
/// Returns `(new_root_key, chain_key)` for the epoch the DH output opens.
pub fn derive_root(
    root_key: &[u8; 32],
    dh_output: &[u8; 32],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_slice()), dh_output);

    let mut okm = [0u8; 64];
    hkdf.expand(ROOT_STEP_INFO, &mut okm).map_err(|_| CryptoError::KeyDerivation)?;

    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);

    Ok((new_root, chain_key))
}

/// Advance a chain key one step.
///
/// Returns `(next_chain_key, message_key)`. The caller must overwrite its
/// stored chain key with the next one; the old value must not be retained.
pub fn advance_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let message_key = keyed_step(chain_key, MESSAGE_KEY_SEED)?;
    let next_chain = keyed_step(chain_key, CHAIN_KEY_SEED)?;
    Ok((next_chain, message_key))
}

fn keyed_step(chain_key: &[u8; 32], seed: u8) -> Result<[u8; 32], CryptoError> {
    let mut hmac =
        Hmac::<Sha256>::new_from_slice(chain_key).map_err(|_| CryptoError::KeyDerivation)?;
    hmac.update(&[seed]);

    let mut out = [0u8; 32];
    out.copy_from_slice(&hmac.finalize().into_bytes());
    Ok(out)
}
