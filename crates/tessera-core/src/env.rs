//! Environment abstraction for deterministic testing.
//!
//! Decouples group logic from system resources (wall clock, randomness).
//! Production code uses [`SystemEnv`]; tests and scenarios use [`SeededEnv`]
//! for reproducible keys, nonces and card timestamps.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Abstract environment providing wall-clock time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - `wall_clock_secs()` never goes backwards within one environment
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Seconds since the Unix epoch. Used for card timestamps.
    fn wall_clock_secs(&self) -> u64;

    /// Fixed-size random array (epoch keys, nonce suffixes, signing seeds).
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Without functioning cryptographic randomness
/// no epoch key or nonce can be generated safely.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }
}

/// Deterministic environment: seeded `ChaCha20` RNG and a manual clock.
///
/// Clones share both the RNG stream and the clock.
#[derive(Clone)]
pub struct SeededEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock: Arc<AtomicU64>,
}

impl SeededEnv {
    /// Environment seeded with `seed`, clock starting at `start_secs`.
    pub fn new(seed: u64, start_secs: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock: Arc::new(AtomicU64::new(start_secs)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Environment for SeededEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("SeededEnv RNG mutex poisoned").fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_random_bytes_differ() {
        let env = SystemEnv::new();
        let a: [u8; 32] = env.random_array();
        let b: [u8; 32] = env.random_array();
        assert_ne!(a, b);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemEnv::new().wall_clock_secs() > 1_577_836_800);
    }

    #[test]
    fn seeded_env_is_reproducible() {
        let a = SeededEnv::new(42, 0);
        let b = SeededEnv::new(42, 0);

        assert_eq!(a.random_array::<16>(), b.random_array::<16>());
        assert_eq!(a.random_array::<16>(), b.random_array::<16>());
    }

    #[test]
    fn seeded_env_clones_share_stream() {
        let a = SeededEnv::new(7, 0);
        let b = a.clone();
        let fresh = SeededEnv::new(7, 0);

        let first: [u8; 8] = a.random_array();
        let second: [u8; 8] = b.random_array();

        assert_eq!(first, fresh.random_array::<8>());
        assert_eq!(second, fresh.random_array::<8>());
    }

    #[test]
    fn seeded_clock_advances() {
        let env = SeededEnv::new(0, 1_000);
        let clone = env.clone();
        env.advance(25);

        assert_eq!(clone.wall_clock_secs(), 1_025);
    }
}
