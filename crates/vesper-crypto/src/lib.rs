//! Vesper Cryptographic Primitives
//!
//! This crate provides the cryptographic building blocks for the Vesper
//! protocol: X25519 agreement, the handshake and ratchet key derivation
//! functions, and the AEAD construction.
//!
//! # Design
//!
//! All functions in this crate are pure - they have no side effects and
//! produce deterministic outputs given the same inputs. Random bytes
//! required for key generation and nonces must be provided by the caller,
//! enabling:
//!
//! - Deterministic testing with seeded RNG
//! - Sans-IO architecture compatibility
//! - No coupling to application-level abstractions
//!
//! # Security Properties
//!
//! - Forward Secrecy: chain keys advance through a one-way KDF; the previous
//!   chain key is unrecoverable from the next one
//! - Post-Compromise Security: every DH ratchet step mixes fresh DH output
//!   into the root key
//! - Header Authenticity: the AEAD tag covers the serialized envelope header
//!   as associated data

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod agreement;
pub mod kdf;

pub use aead::{MESSAGE_KEY_SIZE, NONCE_SIZE, TAG_SIZE, open, seal};
pub use agreement::{derive_handshake_secret, dh, public_key};
pub use kdf::{advance_chain, derive_root};

use thiserror::Error;

/// Failures from the primitive layer.
///
/// Variants deliberately carry no key material; the caller maps them onto
/// the protocol error taxonomy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// HKDF/HMAC expansion failed.
    #[error("key derivation failed")]
    KeyDerivation,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    Encryption,

    /// AEAD tag verification failed.
    #[error("authentication failed")]
    Authentication,
}
