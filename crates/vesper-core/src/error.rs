//! Protocol error taxonomy.

use thiserror::Error;
use vesper_crypto::CryptoError;
use vesper_proto::EnvelopeError;

use crate::identity::UserId;

/// Errors surfaced by the protocol core.
///
/// Messages never embed plaintext or key material; counters and user
/// identifiers are the only payload-adjacent data they carry.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed input to an API boundary.
    #[error("validation failed: {reason}")]
    Validation {
        /// Description of the rejected input.
        reason: String,
    },

    /// Signature or bundle verification failure.
    #[error("integrity check failed: {reason}")]
    Integrity {
        /// Description of the failed check.
        reason: String,
    },

    /// No bundle could be fetched for the peer, or the relay has no mailbox.
    #[error("peer unavailable: {user}")]
    PeerUnavailable {
        /// The unreachable peer.
        user: UserId,
    },

    /// One-time prekey pool is empty.
    ///
    /// Non-fatal: callers fall back to a bundle without a one-time prekey,
    /// which weakens but does not break the handshake.
    #[error("one-time prekey pool exhausted for {user}")]
    KeyPoolExhausted {
        /// The user whose pool is empty.
        user: UserId,
    },

    /// Handshake attempted while a session already exists.
    #[error("session already exists: {local} -> {remote}")]
    SessionAlreadyExists {
        /// Local side of the pair.
        local: UserId,
        /// Remote side of the pair.
        remote: UserId,
    },

    /// No session for the pair and the envelope carries no handshake.
    #[error("session not found: {local} -> {remote}")]
    SessionNotFound {
        /// Local side of the pair.
        local: UserId,
        /// Remote side of the pair.
        remote: UserId,
    },

    /// Message key already consumed and absent from the skipped-key cache.
    #[error("replay detected: message {counter} already consumed")]
    ReplayDetected {
        /// Counter of the replayed message.
        counter: u32,
    },

    /// Counter gap larger than the skip bound.
    #[error("skip bound exceeded: gap of {requested} exceeds {limit}")]
    SkippedTooMany {
        /// Number of message keys the gap would require deriving.
        requested: u32,
        /// Configured bound.
        limit: u32,
    },

    /// AEAD tag mismatch; no chain state was mutated.
    #[error("message authentication failed")]
    AuthenticationFailure,

    /// Structural envelope violation, detected before any cryptography.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),

    /// Relay or directory transport failure, surfaced after bounded retry.
    #[error("transport failure: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// Session persistence failure.
    #[error("storage failure: {reason}")]
    Storage {
        /// Description of the storage failure.
        reason: String,
    },
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => Self::AuthenticationFailure,
            CryptoError::KeyDerivation | CryptoError::Encryption => {
                Self::Integrity { reason: err.to_string() }
            },
        }
    }
}

impl ProtocolError {
    /// Returns true if this error is fatal (unrecoverable).
    ///
    /// Fatal errors indicate protocol violations or hostile input and must
    /// not be retried. Transient errors may resolve on retry or by falling
    /// back to a degraded path.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::PeerUnavailable { .. }
            | Self::KeyPoolExhausted { .. }
            | Self::Transport { .. }
            | Self::Storage { .. } => false,

            Self::Validation { .. }
            | Self::Integrity { .. }
            | Self::SessionAlreadyExists { .. }
            | Self::SessionNotFound { .. }
            | Self::ReplayDetected { .. }
            | Self::SkippedTooMany { .. }
            | Self::AuthenticationFailure
            | Self::MalformedEnvelope(_) => true,
        }
    }
}
