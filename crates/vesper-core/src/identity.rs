//! User identifiers.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Validated user identifier.
///
/// The handshake and ratchet logic is generic over identifiers; validation
/// happens once at this boundary rather than being re-checked downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Maximum identifier length in bytes.
    pub const MAX_LEN: usize = 64;

    /// Validate and wrap a raw identifier.
    ///
    /// Accepts 1..=64 ASCII characters from `[A-Za-z0-9._@-]`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Validation` for empty, oversized, or
    /// out-of-alphabet input.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(ProtocolError::Validation { reason: "user id is empty".to_string() });
        }
        if raw.len() > Self::MAX_LEN {
            return Err(ProtocolError::Validation {
                reason: format!("user id exceeds {} bytes", Self::MAX_LEN),
            });
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-')))
        {
            return Err(ProtocolError::Validation {
                reason: format!("user id contains invalid character {bad:?}"),
            });
        }

        Ok(Self(raw))
    }

    /// View as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for UserId {
    type Error = ProtocolError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}
