//! Production Environment implementation using system time and RNG.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use vesper_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// - `std::time::Instant::now()` for monotonic time
/// - `tokio::time::sleep()` for async sleeping
/// - `getrandom` (OS entropy pool) for ratchet keys, ephemerals, and nonces
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).unwrap_or_else(|e| {
            // NOTE: This should never fail on supported platforms; a zeroed
            // buffer is not secure, but refusing to panic keeps the failure
            // visible in logs instead of aborting mid-protocol.
            tracing::error!("getrandom failed: {}", e);
            buffer.fill(0);
        });
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |since| since.as_millis() as u64)
    }
}
