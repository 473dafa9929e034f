//! Simulated environment.
//!
//! Time is Tokio's clock, so a test running with a paused runtime
//! (`#[tokio::test(start_paused = true)]`) sees virtual time that only moves
//! when every task is idle or when the test advances it. Randomness comes
//! from a seeded `ChaCha8Rng`: the same seed yields the same connection and
//! node ids on every run.

use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use concord_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;

/// Wall-clock origin of every simulation (2023-11-14T22:13:20Z).
const WALL_CLOCK_ORIGIN_MS: u64 = 1_700_000_000_000;

/// Deterministic environment for simulation tests.
///
/// Clones share the RNG and the clock skew.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
    origin: Instant,
    /// Extra offset added on top of Tokio's clock, in milliseconds.
    skew_ms: Arc<AtomicU64>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            origin: Instant::now(),
            skew_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Jump this environment's clock forward without waiting.
    ///
    /// Timers already running on Tokio's clock are not affected; use
    /// `tokio::time::advance` when those must fire too.
    pub fn skip(&self, by: Duration) {
        self.skew_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulated time elapsed since the environment was created.
    pub fn elapsed(&self) -> Duration {
        self.now() - self.origin
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now() + Duration::from_millis(self.skew_ms.load(Ordering::SeqCst))
    }

    fn wall_clock_millis(&self) -> u64 {
        WALL_CLOCK_ORIGIN_MS + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_ids() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);

        let ids_a: Vec<u64> = (0..8).map(|_| a.random_u64()).collect();
        let ids_b: Vec<u64> = (0..8).map(|_| b.random_u64()).collect();

        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn different_seeds_diverge() {
        assert_ne!(SimEnv::with_seed(1).random_u64(), SimEnv::with_seed(2).random_u64());
    }

    #[test]
    fn clones_share_the_rng() {
        let env = SimEnv::with_seed(7);
        let clone = env.clone();
        let reference = SimEnv::with_seed(7);

        let first = env.random_u64();
        let second = clone.random_u64();

        assert_eq!(first, reference.random_u64());
        assert_eq!(second, reference.random_u64());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_advances_virtual_time() {
        let env = SimEnv::new();
        let start = env.now();

        env.sleep(Duration::from_secs(30)).await;

        assert!(env.now() - start >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_moves_clock_and_wall_clock() {
        let env = SimEnv::new();
        let wall = env.wall_clock_millis();

        env.skip(Duration::from_secs(5));

        assert_eq!(env.elapsed(), Duration::from_secs(5));
        assert_eq!(env.wall_clock_millis(), wall + 5_000);
    }
}
