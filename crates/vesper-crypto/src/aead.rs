//! AEAD construction: XChaCha20-Poly1305.
//!
//! The 24-byte nonce is wide enough to be drawn at random per message; each
//! message key is used exactly once, so nonce reuse across keys is not a
//! concern. The envelope header rides as associated data, binding the
//! ratchet public key and counters to the ciphertext.

use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, Payload},
};

use crate::CryptoError;

/// Size of a derived message key.
pub const MESSAGE_KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 tag appended to the ciphertext.
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, authenticating `aad`.
///
/// Returns ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &[u8; MESSAGE_KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and authenticate `ciphertext` under `key` and `aad`.
///
/// # Errors
///
/// Returns `CryptoError::Authentication` on any tag mismatch; no partial
/// plaintext is ever returned.
pub fn open(
    key: &[u8; MESSAGE_KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const KEY: [u8; MESSAGE_KEY_SIZE] = [0xa5; MESSAGE_KEY_SIZE];
    const NONCE: [u8; NONCE_SIZE] = [0x5a; NONCE_SIZE];

    #[test]
    fn seal_open_roundtrip() {
        let ciphertext = seal(&KEY, &NONCE, b"hello", b"header").unwrap();
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);

        let plaintext = open(&KEY, &NONCE, &ciphertext, b"header").unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ciphertext = seal(&KEY, &NONCE, b"hello", b"header").unwrap();
        let result = open(&[0; MESSAGE_KEY_SIZE], &NONCE, &ciphertext, b"header");
        assert_eq!(result, Err(CryptoError::Authentication));
    }

    #[test]
    fn modified_aad_fails_authentication() {
        let ciphertext = seal(&KEY, &NONCE, b"hello", b"header").unwrap();
        let result = open(&KEY, &NONCE, &ciphertext, b"tampered");
        assert_eq!(result, Err(CryptoError::Authentication));
    }

    #[test]
    fn flipped_ciphertext_bit_fails_authentication() {
        let mut ciphertext = seal(&KEY, &NONCE, b"hello", b"header").unwrap();
        ciphertext[0] ^= 0x01;
        let result = open(&KEY, &NONCE, &ciphertext, b"header");
        assert_eq!(result, Err(CryptoError::Authentication));
    }

    #[test]
    fn empty_plaintext_is_tag_only() {
        let ciphertext = seal(&KEY, &NONCE, b"", b"").unwrap();
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert_eq!(open(&KEY, &NONCE, &ciphertext, b"").unwrap(), b"");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext: Vec<u8>, aad: Vec<u8>) {
            let ciphertext = seal(&KEY, &NONCE, &plaintext, &aad).unwrap();
            prop_assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
            prop_assert_eq!(open(&KEY, &NONCE, &ciphertext, &aad).unwrap(), plaintext);
        }
    }
}
