//! Resilience guard: circuit breaker around external dependencies.
//!
//! Wraps every hot-path call to durable storage, the bus and the
//! authenticator. While the circuit is open, calls fail fast with
//! [`GuardError::Unavailable`] without touching the dependency.

use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use concord_core::{Admission, BreakerConfig, BreakerState, CircuitBreaker, Environment, SyncError};
use thiserror::Error;

/// Classifies errors that count against a dependency's health.
///
/// Logical rejections (a version conflict, a bad credential) mean the
/// dependency answered and must not open the circuit.
pub trait DependencyFailure {
    /// Whether this error indicates the dependency is unhealthy.
    fn is_dependency_failure(&self) -> bool;
}

/// Outcome of a guarded call that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError<E> {
    /// Circuit open; the dependency was not called.
    #[error("{dependency} unavailable, retry after {retry_after:?}")]
    Unavailable {
        /// Name of the guarded dependency.
        dependency: &'static str,
        /// Time until a trial call may be admitted.
        retry_after: Duration,
    },

    /// The dependency was called and failed.
    #[error(transparent)]
    Failed(E),
}

impl<E> GuardError<E> {
    /// Map an open circuit to the shared taxonomy, and the inner error with
    /// `inner`.
    pub fn into_sync_error(self, inner: impl FnOnce(E) -> SyncError) -> SyncError {
        match self {
            Self::Unavailable { dependency, retry_after } => {
                SyncError::DependencyUnavailable { dependency: dependency.to_owned(), retry_after }
            },
            Self::Failed(e) => inner(e),
        }
    }
}

/// Circuit breaker bound to one dependency and a clock.
pub struct ResilienceGuard<E: Environment> {
    dependency: &'static str,
    env: E,
    breaker: Mutex<CircuitBreaker<E::Instant>>,
}

impl<E: Environment> ResilienceGuard<E> {
    /// Create a closed guard for `dependency`.
    pub fn new(dependency: &'static str, env: E, config: BreakerConfig) -> Self {
        Self { dependency, env, breaker: Mutex::new(CircuitBreaker::new(config)) }
    }

    /// Name of the guarded dependency.
    pub fn dependency(&self) -> &'static str {
        self.dependency
    }

    /// Current breaker state.
    pub fn state(&self) -> BreakerState {
        self.lock().state()
    }

    /// Run `op` through the breaker.
    ///
    /// # Errors
    ///
    /// - `GuardError::Unavailable` if the circuit rejected the call
    /// - `GuardError::Failed` if `op` failed
    pub async fn call<T, Er, F, Fut>(&self, op: F) -> Result<T, GuardError<Er>>
    where
        Er: DependencyFailure,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Er>>,
    {
        let admission = {
            let now = self.env.now();
            self.lock().admit(now)
        };

        let admission = match admission {
            Ok(admission) => admission,
            Err(open) => {
                tracing::debug!(dependency = self.dependency, "circuit open, failing fast");
                return Err(GuardError::Unavailable {
                    dependency: self.dependency,
                    retry_after: open.retry_after,
                });
            },
        };

        let mut trial = TrialSlot { guard: self, armed: admission == Admission::Trial };
        let result = op().await;
        trial.armed = false;

        match &result {
            Err(e) if e.is_dependency_failure() => self.record_failure(),
            _ => self.record_success(admission),
        }

        result.map_err(GuardError::Failed)
    }

    fn record_success(&self, admission: Admission) {
        if self.lock().record_success(admission) {
            tracing::info!(dependency = self.dependency, "trial call succeeded, circuit closed");
        }
    }

    fn record_failure(&self) {
        let now = self.env.now();
        if self.lock().record_failure(now) {
            tracing::warn!(dependency = self.dependency, "circuit opened");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreaker<E::Instant>> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the half-open slot if a trial call's future is dropped.
struct TrialSlot<'a, E: Environment> {
    guard: &'a ResilienceGuard<E>,
    armed: bool,
}

impl<E: Environment> Drop for TrialSlot<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            self.guard.lock().abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_env::ManualEnv;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Down,
        Rejected,
    }

    impl DependencyFailure for FakeError {
        fn is_dependency_failure(&self) -> bool {
            matches!(self, Self::Down)
        }
    }

    #[tokio::test]
    async fn opens_after_five_failures_and_fails_fast() {
        let env = ManualEnv::new();
        let guard = ResilienceGuard::new("storage", env.clone(), BreakerConfig::default());
        let attempts = AtomicUsize::new(0);

        for _ in 0..5 {
            let result: Result<(), _> = guard
                .call(|| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(FakeError::Down) }
                })
                .await;
            assert_eq!(result, Err(GuardError::Failed(FakeError::Down)));
        }
        assert_eq!(guard.state(), BreakerState::Open);

        let sixth: Result<(), _> = guard
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), FakeError>(()) }
            })
            .await;
        assert!(matches!(sixth, Err(GuardError::Unavailable { dependency: "storage", .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 5, "sixth call must not reach storage");

        env.advance(Duration::from_secs(10));
        let trial: Result<u32, GuardError<FakeError>> = guard.call(|| async { Ok(1) }).await;
        assert_eq!(trial, Ok(1));
        assert_eq!(guard.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn logical_rejections_keep_circuit_closed() {
        let guard = ResilienceGuard::new("storage", ManualEnv::new(), BreakerConfig::default());
        for _ in 0..20 {
            let _: Result<(), _> = guard.call(|| async { Err(FakeError::Rejected) }).await;
        }
        assert_eq!(guard.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn dropped_trial_releases_slot() {
        let env = ManualEnv::new();
        let guard = ResilienceGuard::new("bus", env.clone(), BreakerConfig::default());
        for _ in 0..5 {
            let _: Result<(), _> = guard.call(|| async { Err(FakeError::Down) }).await;
        }
        env.advance(Duration::from_secs(11));

        let pending = guard.call(|| std::future::pending::<Result<(), FakeError>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(guard.state(), BreakerState::HalfOpen);

        let retry: Result<(), GuardError<FakeError>> = guard.call(|| async { Ok(()) }).await;
        assert_eq!(retry, Ok(()));
    }

    #[tokio::test]
    async fn only_the_trial_closes_a_half_open_circuit() {
        let env = ManualEnv::new();
        let guard = ResilienceGuard::new("storage", env.clone(), BreakerConfig::default());

        let (finish_slow, slow_done) = tokio::sync::oneshot::channel::<()>();
        let slow = guard.call(|| async move { slow_done.await.map_err(|_| FakeError::Down) });
        tokio::pin!(slow);
        assert!(tokio::time::timeout(Duration::from_millis(1), slow.as_mut()).await.is_err());

        for _ in 0..5 {
            let _: Result<(), _> = guard.call(|| async { Err(FakeError::Down) }).await;
        }
        env.advance(Duration::from_secs(10));

        let (finish_trial, trial_done) = tokio::sync::oneshot::channel::<()>();
        let trial = guard.call(|| async move { trial_done.await.map_err(|_| FakeError::Down) });
        tokio::pin!(trial);
        assert!(tokio::time::timeout(Duration::from_millis(1), trial.as_mut()).await.is_err());
        assert_eq!(guard.state(), BreakerState::HalfOpen);

        // Admitted before the circuit opened; its success proves nothing now
        let _ = finish_slow.send(());
        assert_eq!(slow.await, Ok(()));
        assert_eq!(guard.state(), BreakerState::HalfOpen);

        let _ = finish_trial.send(());
        assert_eq!(trial.await, Ok(()));
        assert_eq!(guard.state(), BreakerState::Closed);
    }

    #[test]
    fn unavailable_maps_to_taxonomy() {
        let err: GuardError<FakeError> =
            GuardError::Unavailable { dependency: "bus", retry_after: Duration::from_secs(2) };
        let mapped = err.into_sync_error(|_| SyncError::Storage("unused".to_owned()));
        assert_eq!(
            mapped,
            SyncError::DependencyUnavailable {
                dependency: "bus".to_owned(),
                retry_after: Duration::from_secs(2)
            }
        );
    }
}
