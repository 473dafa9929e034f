//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails operations with `StorageError::Io` to exercise the
//! resilience guard, the resolver's error paths and catch-up under storage
//! trouble. The failure rate can be changed while the wrapper is in use, so a
//! test can take storage down and bring it back.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use concord_core::StateRecord;
use concord_proto::SessionId;

use super::{Storage, StorageError};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with probability `failure_rate`. Clones share the RNG, the rate and the
/// counters.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate as f64 bits (0.0 = never fail, 1.0 = always fail)
    failure_rate: Arc<AtomicU64>,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operations attempted, including injected failures
    operation_count: Arc<AtomicUsize>,
    /// Operations that reached the inner storage
    forwarded_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator: fast, and reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

fn checked_rate(failure_rate: f64) -> f64 {
    assert!(
        (0.0..=1.0).contains(&failure_rate),
        "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
    );
    failure_rate
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: Arc::new(AtomicU64::new(checked_rate(failure_rate).to_bits())),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            forwarded_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Change the failure rate for subsequent operations.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn set_failure_rate(&self, failure_rate: f64) {
        self.failure_rate.store(checked_rate(failure_rate).to_bits(), Ordering::SeqCst);
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Operations that were passed through to the inner storage.
    pub fn forwarded_count(&self) -> usize {
        self.forwarded_count.load(Ordering::SeqCst)
    }

    /// Count the operation and decide whether to inject a failure.
    fn roll(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);

        let rate = f64::from_bits(self.failure_rate.load(Ordering::SeqCst));
        let sample = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if sample < rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }

        self.forwarded_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl<S: Storage> Storage for ChaoticStorage<S> {
    async fn save(&self, record: &StateRecord) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.save(record).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<StateRecord>, StorageError> {
        self.roll()?;
        self.inner.load(session_id).await
    }

    async fn load_since(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StateRecord>, StorageError> {
        self.roll()?;
        self.inner.load_since(session_id, after, limit).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, StorageError> {
        self.roll()?;
        self.inner.list_sessions().await
    }
}
