//! Vesper Wire Format
//!
//! This crate defines the byte-level protocol that rides over the relay:
//! the envelope (ratchet header + authenticated ciphertext) and the prekey
//! bundle payload served by the directory.
//!
//! # Design
//!
//! The codec has no cryptographic authority of its own. It performs purely
//! structural validation (lengths, varints, kind tags) and rejects malformed
//! input before any cryptographic operation is attempted. Authenticity of
//! the header is delegated entirely to the AEAD tag computed over the
//! serialized header bytes.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod bundle;
pub mod envelope;
pub mod varint;

pub use bundle::{OneTimePreKeyPublic, PreKeyBundle, SIGNATURE_SIZE};
pub use envelope::{
    Envelope, EnvelopeError, EnvelopeHeader, HandshakeHeader, NONCE_SIZE, RATCHET_KEY_SIZE,
    TAG_SIZE,
};
