//! Prekey bundle payload.
//!
//! The bundle is what a directory serves for a user: everything an initiator
//! needs to run the asynchronous handshake while the responder is offline.
//! It is public material and is serialized with CBOR like the other
//! directory payloads.

use serde::{Deserialize, Serialize};

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// A single-use prekey public, allocated into at most one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Pool id, echoed back by the initiator's handshake header.
    pub id: u32,
    /// X25519 public key.
    pub key: [u8; 32],
}

/// Public key material fetched per handshake.
///
/// The signed prekey signature is made with the identity Ed25519 key over
/// the signed prekey public; initiators must verify it before any DH
/// computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Identity Ed25519 public key (verifies the signed prekey signature).
    pub identity_signing_key: [u8; 32],
    /// Identity X25519 public key (DH participant).
    pub identity_agreement_key: [u8; 32],
    /// Id of the signed prekey below.
    pub signed_prekey_id: u32,
    /// Medium-term signed prekey, X25519 public.
    pub signed_prekey: [u8; 32],
    /// Ed25519 signature over `signed_prekey`, 64 bytes.
    pub signed_prekey_signature: Vec<u8>,
    /// One-time prekey, absent when the responder's pool is exhausted.
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bundle(one_time: Option<OneTimePreKeyPublic>) -> PreKeyBundle {
        PreKeyBundle {
            identity_signing_key: [1; 32],
            identity_agreement_key: [2; 32],
            signed_prekey_id: 11,
            signed_prekey: [3; 32],
            signed_prekey_signature: vec![4; SIGNATURE_SIZE],
            one_time_prekey: one_time,
        }
    }

    #[test]
    fn bundle_cbor_roundtrip() {
        let original = bundle(Some(OneTimePreKeyPublic { id: 5, key: [6; 32] }));

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&original, &mut bytes).unwrap();

        let decoded: PreKeyBundle = ciborium::de::from_reader(&bytes[..]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn degraded_bundle_cbor_roundtrip() {
        let original = bundle(None);

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&original, &mut bytes).unwrap();

        let decoded: PreKeyBundle = ciborium::de::from_reader(&bytes[..]).unwrap();
        assert_eq!(decoded.one_time_prekey, None);
        assert_eq!(decoded, original);
    }
}
