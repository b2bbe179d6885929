//! Envelope codec.
//!
//! The envelope is the unit transmitted over the relay:
//!
//! ```text
//! [kind u8]
//! [sender ratchet public key: 32]
//! [previous chain length: varint]
//! [message number: varint]
//! [handshake section, prekey envelopes only:
//!     initiator identity X25519: 32
//!     initiator ephemeral X25519: 32
//!     signed prekey id: varint
//!     one-time flag: u8  (0x01 followed by one-time prekey id varint)]
//! [nonce: 24]
//! [ciphertext || tag]
//! ```
//!
//! Everything before the nonce is the header; the header bytes are the AEAD
//! associated data, so any bit flipped here fails authentication during
//! decryption rather than in the codec.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::varint::{get_uvarint, put_uvarint};

/// Size of an X25519 ratchet public key on the wire.
pub const RATCHET_KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag.
pub const TAG_SIZE: usize = 16;

/// Ordinary ratchet message.
const KIND_MESSAGE: u8 = 1;

/// First-contact message carrying the handshake section.
const KIND_PREKEY: u8 = 2;

/// One-time prekey presence flags in the handshake section.
const ONE_TIME_ABSENT: u8 = 0;
const ONE_TIME_PRESENT: u8 = 1;

/// Structural decode failures.
///
/// These are detected before any cryptographic work and carry no secret
/// material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Input ended before a complete field was read.
    #[error("envelope truncated")]
    UnexpectedEnd,

    /// Leading kind byte is not a known envelope kind.
    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),

    /// A varint field did not fit in a u32.
    #[error("varint overflows u32")]
    VarintOverflow,

    /// One-time prekey flag byte is not a known value.
    #[error("invalid one-time prekey flag: {0}")]
    InvalidOneTimeFlag(u8),

    /// Ciphertext shorter than the AEAD tag.
    #[error("ciphertext too short: {len} bytes")]
    CiphertextTooShort {
        /// Observed ciphertext length.
        len: usize,
    },
}

/// Handshake section attached to prekey envelopes.
///
/// Identifies the key agreement inputs so the responder can derive the same
/// shared secret: the initiator's identity and ephemeral X25519 publics and
/// the ids of the responder prekeys the initiator used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's identity X25519 public key.
    pub identity_key: [u8; RATCHET_KEY_SIZE],
    /// Initiator's ephemeral X25519 public key.
    pub ephemeral_key: [u8; RATCHET_KEY_SIZE],
    /// Id of the responder signed prekey used in the handshake.
    pub signed_prekey_id: u32,
    /// Id of the responder one-time prekey, when one was allocated.
    pub one_time_prekey_id: Option<u32>,
}

/// Envelope header: the AEAD associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; RATCHET_KEY_SIZE],
    /// Length of the sender's previous sending chain (PN).
    pub previous_chain_len: u32,
    /// Message number within the current sending chain (N).
    pub counter: u32,
    /// Handshake section, present on first-contact envelopes.
    pub handshake: Option<HandshakeHeader>,
}

impl EnvelopeHeader {
    /// Serialize the header. These bytes are the AEAD associated data.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(if self.handshake.is_some() { KIND_PREKEY } else { KIND_MESSAGE });
        buf.put_slice(&self.ratchet_key);
        put_uvarint(&mut buf, self.previous_chain_len);
        put_uvarint(&mut buf, self.counter);

        if let Some(handshake) = &self.handshake {
            buf.put_slice(&handshake.identity_key);
            buf.put_slice(&handshake.ephemeral_key);
            put_uvarint(&mut buf, handshake.signed_prekey_id);
            match handshake.one_time_prekey_id {
                Some(id) => {
                    buf.put_u8(ONE_TIME_PRESENT);
                    put_uvarint(&mut buf, id);
                },
                None => buf.put_u8(ONE_TIME_ABSENT),
            }
        }

        buf
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, EnvelopeError> {
        let kind = take_u8(buf)?;
        let with_handshake = match kind {
            KIND_MESSAGE => false,
            KIND_PREKEY => true,
            other => return Err(EnvelopeError::UnknownKind(other)),
        };

        let ratchet_key = take_array(buf)?;
        let previous_chain_len = get_uvarint(buf)?;
        let counter = get_uvarint(buf)?;

        let handshake = if with_handshake {
            let identity_key = take_array(buf)?;
            let ephemeral_key = take_array(buf)?;
            let signed_prekey_id = get_uvarint(buf)?;
            let one_time_prekey_id = match take_u8(buf)? {
                ONE_TIME_ABSENT => None,
                ONE_TIME_PRESENT => Some(get_uvarint(buf)?),
                other => return Err(EnvelopeError::InvalidOneTimeFlag(other)),
            };
            Some(HandshakeHeader {
                identity_key,
                ephemeral_key,
                signed_prekey_id,
                one_time_prekey_id,
            })
        } else {
            None
        };

        Ok(Self { ratchet_key, previous_chain_len, counter, handshake })
    }
}

/// Serialized wire unit: header + nonce + authenticated ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Header covered by the AEAD tag as associated data.
    pub header: EnvelopeHeader,
    /// AEAD nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with trailing authentication tag.
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("header", &self.header)
            .field("ciphertext", &format!("<{} bytes>", self.ciphertext.len()))
            .finish_non_exhaustive()
    }
}

impl Envelope {
    /// Serialize to relay bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.header.encode();
        buf.reserve(NONCE_SIZE + self.ciphertext.len());
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.ciphertext);
        buf
    }

    /// Parse relay bytes.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError` on any structural violation; no cryptographic
    /// checks happen here.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut buf = bytes;
        let header = EnvelopeHeader::decode(&mut buf)?;
        let nonce: [u8; NONCE_SIZE] = take_array(&mut buf)?;

        if buf.len() < TAG_SIZE {
            return Err(EnvelopeError::CiphertextTooShort { len: buf.len() });
        }
        let ciphertext = buf.to_vec();

        Ok(Self { header, nonce, ciphertext })
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, EnvelopeError> {
    if !buf.has_remaining() {
        return Err(EnvelopeError::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], EnvelopeError> {
    if buf.remaining() < N {
        return Err(EnvelopeError::UnexpectedEnd);
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
