//! X25519 agreement and the handshake secret derivation.
//!
//! Key material crosses this boundary as raw 32-byte arrays; the dalek
//! types live only inside this module so callers can store and serialize
//! plain bytes.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::CryptoError;

/// Domain separation for the handshake secret.
const HANDSHAKE_INFO: &[u8] = b"vesper x3dh v1";

/// Compute the X25519 public key for a secret scalar.
pub fn public_key(secret: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*secret);
    PublicKey::from(&secret).to_bytes()
}

/// X25519 Diffie-Hellman between a local secret and a remote public key.
pub fn dh(secret: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*secret);
    let public = PublicKey::from(*public);
    secret.diffie_hellman(&public).to_bytes()
}

/// Derive the 32-byte handshake shared secret from the DH outputs.
///
/// Input keying material is `0xFF * 32 || DH1 || DH2 || DH3 [|| DH4]`; the
/// fourth output participates only when the responder had a one-time prekey
/// to offer. Omitting DH4 weakens but does not break the agreement.
pub fn derive_handshake_secret(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(&[0xff; 32]);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut secret = [0u8; 32];
    hkdf.expand(HANDSHAKE_INFO, &mut secret).map_err(|_| CryptoError::KeyDerivation)?;

    Ok(secret)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dh_commutes() {
        let a = [5; 32];
        let b = [9; 32];
        let a_pub = public_key(&a);
        let b_pub = public_key(&b);

        assert_eq!(dh(&a, &b_pub), dh(&b, &a_pub));
    }

    #[test]
    fn distinct_secrets_give_distinct_publics() {
        assert_ne!(public_key(&[5; 32]), public_key(&[6; 32]));
    }

    #[test]
    fn handshake_secret_is_deterministic() {
        let sk1 = derive_handshake_secret(&[1; 32], &[2; 32], &[3; 32], Some(&[4; 32])).unwrap();
        let sk2 = derive_handshake_secret(&[1; 32], &[2; 32], &[3; 32], Some(&[4; 32])).unwrap();
        assert_eq!(sk1, sk2);
    }

    #[test]
    fn one_time_prekey_changes_the_secret() {
        let with = derive_handshake_secret(&[1; 32], &[2; 32], &[3; 32], Some(&[4; 32])).unwrap();
        let without = derive_handshake_secret(&[1; 32], &[2; 32], &[3; 32], None).unwrap();
        assert_ne!(with, without);
    }

    #[test]
    fn dh_order_matters() {
        let sk_a = derive_handshake_secret(&[1; 32], &[2; 32], &[3; 32], None).unwrap();
        let sk_b = derive_handshake_secret(&[2; 32], &[1; 32], &[3; 32], None).unwrap();
        assert_ne!(sk_a, sk_b);
    }
}
