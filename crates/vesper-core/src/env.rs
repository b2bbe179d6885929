//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples protocol logic from system resources
//! (time, randomness). Protocol code never reaches for an ambient RNG or
//! clock; everything flows through the injected environment, so:
//!
//! - tests run against a seeded RNG and a virtual clock, reproducing any
//!   failure exactly,
//! - production swaps in OS entropy and real time without touching the
//!   protocol logic.
//!
//! # Invariants
//!
//! - Monotonicity: `now()` never goes backwards
//! - Determinism: given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: implementations must not share global state

use std::time::{Duration, Instant};

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// 1. Time monotonicity: `now()` never goes backwards
/// 2. RNG quality: `random_bytes()` uses cryptographically secure entropy in
///    production (ratchet keys, ephemeral keys, and nonces all come from it)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait; used by retry/backoff driver
    /// code, never by protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Production implementations MUST source these from the OS entropy
    /// pool. Simulation implementations use a seeded RNG and log the seed
    /// for reproducibility.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Milliseconds since the Unix epoch, for message metadata.
    ///
    /// Never used in key derivation; timestamps only label receipts and
    /// deliveries.
    fn unix_millis(&self) -> u64;

    /// Generates a random `u64`, e.g. for message identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random fixed-size array, e.g. a key seed or nonce.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    //! Deterministic environment for unit tests.

    use std::sync::{Arc, Mutex};

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::*;

    /// Seeded environment: reproducible randomness, logical wall clock.
    #[derive(Clone)]
    pub(crate) struct TestEnv {
        rng: Arc<Mutex<ChaCha20Rng>>,
        clock_ms: Arc<Mutex<u64>>,
    }

    impl TestEnv {
        pub(crate) fn seeded(seed: u64) -> Self {
            Self {
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
                clock_ms: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl Environment for TestEnv {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().unwrap().fill_bytes(buffer);
        }

        fn unix_millis(&self) -> u64 {
            let mut clock = self.clock_ms.lock().unwrap();
            *clock += 1;
            *clock
        }
    }
}
