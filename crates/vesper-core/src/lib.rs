//! Vesper Protocol Core
//!
//! State machines for the Vesper two-party encrypted messaging protocol:
//! key material lifecycle, X3DH-style handshake, the double-ratchet
//! engine, and the store/directory interfaces the engine consumes.
//!
//! ## Architecture
//!
//! ```text
//! vesper-core
//!   ├─ KeyMaterialStore   (identity, signed prekeys, one-time pool)
//!   ├─ BundleDirectory    (prekey bundle exchange interface)
//!   ├─ handshake          (X3DH-style key agreement)
//!   ├─ ratchet            (double-ratchet encrypt/decrypt)
//!   ├─ SessionState       (per-pair chains, skipped keys, bounds)
//!   ├─ SessionStore       (persistence interface)
//!   └─ Environment        (time/randomness abstraction)
//! ```
//!
//! Protocol logic is sans-IO: randomness and time flow in through
//! [`Environment`], network and persistence through the store/directory
//! traits, so every state transition is deterministic under a seeded
//! environment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod env;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod keystore;
pub mod ratchet;
pub mod session;
pub mod store;

pub use directory::{BundleDirectory, InMemoryDirectory};
pub use env::Environment;
pub use error::ProtocolError;
pub use identity::UserId;
pub use keystore::{DEFAULT_ONE_TIME_POOL, IdentityPublic, KeyMaterialStore};
pub use session::{MAX_CACHED_KEYS, MAX_RETAINED_CHAINS, MAX_SKIP, SessionState};
pub use store::{MemorySessionStore, SessionStore};
