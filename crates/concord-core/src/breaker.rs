//! Circuit breaker state machine.
//!
//! Pure logic: time is passed in, no locks, no I/O. The server wraps it in a
//! guard that owns the clock and the synchronization.
//!
//! ```text
//!            threshold failures
//!            within window
//! ┌────────┐ ──────────────────> ┌──────┐
//! │ Closed │                     │ Open │<──────────┐
//! └────────┘ <──┐                └──────┘           │
//!               │                   │ recovery      │ trial
//!       trial   │                   │ timeout       │ failed
//!     succeeded │                   ↓               │
//!               │              ┌──────────┐         │
//!               └──────────────│ HalfOpen │─────────┘
//!                              └──────────┘
//! ```

use std::{collections::VecDeque, ops::Sub, time::Duration};

use thiserror::Error;

/// Failures within the window that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Sliding window over which failures are counted.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Time the circuit stays open before admitting a trial call.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Sliding window for counting failures.
    pub failure_window: Duration,
    /// Open duration before a trial call is admitted.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is admitted.
    HalfOpen,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Pass,
    /// The single half-open trial call.
    Trial,
}

/// Call rejected without reaching the dependency.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("circuit open, retry after {retry_after:?}")]
pub struct CircuitOpen {
    /// Time until a trial call may be admitted.
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Phase<I> {
    Closed,
    Open { opened_at: I },
    HalfOpen { trial_in_flight: bool },
}

/// Closed/Open/HalfOpen circuit breaker.
///
/// # Invariants
///
/// - At most one call is admitted while half-open, and only its success
///   closes the circuit.
/// - A success while closed clears the failure count, so only consecutive
///   failures inside the window open the circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker<I> {
    config: BreakerConfig,
    phase: Phase<I>,
    failures: VecDeque<I>,
}

impl<I> CircuitBreaker<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, phase: Phase::Closed, failures: VecDeque::new() }
    }

    /// Current state. An open circuit whose recovery timeout has elapsed is
    /// still reported as open until the next [`Self::admit`].
    #[must_use]
    pub fn state(&self) -> BreakerState {
        match self.phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Failures currently counted toward the threshold.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Decide whether a call may proceed at `now`.
    ///
    /// # Errors
    ///
    /// - [`CircuitOpen`] while open, or while half-open with the trial in
    ///   flight.
    pub fn admit(&mut self, now: I) -> Result<Admission, CircuitOpen> {
        match self.phase {
            Phase::Closed => Ok(Admission::Pass),
            Phase::Open { opened_at } => {
                let elapsed = now - opened_at;
                if elapsed >= self.config.recovery_timeout {
                    self.phase = Phase::HalfOpen { trial_in_flight: true };
                    Ok(Admission::Trial)
                } else {
                    Err(CircuitOpen { retry_after: self.config.recovery_timeout - elapsed })
                }
            },
            Phase::HalfOpen { trial_in_flight: true } => {
                Err(CircuitOpen { retry_after: Duration::ZERO })
            },
            Phase::HalfOpen { trial_in_flight: false } => {
                self.phase = Phase::HalfOpen { trial_in_flight: true };
                Ok(Admission::Trial)
            },
        }
    }

    /// Record a successful call admitted as `admission`. Returns `true` if
    /// this success closed the circuit.
    ///
    /// Only the trial call closes a half-open circuit.
    pub fn record_success(&mut self, admission: Admission) -> bool {
        match (self.phase, admission) {
            (Phase::Closed, _) => {
                self.failures.clear();
                false
            },
            (Phase::HalfOpen { .. }, Admission::Trial) => {
                self.failures.clear();
                self.phase = Phase::Closed;
                true
            },
            // A call admitted before the circuit opened finished late.
            (Phase::HalfOpen { .. } | Phase::Open { .. }, _) => false,
        }
    }

    /// Record a failed call at `now`. Returns `true` if this failure opened
    /// the circuit.
    pub fn record_failure(&mut self, now: I) -> bool {
        match self.phase {
            Phase::Closed => {
                let window = self.config.failure_window;
                while self.failures.front().is_some_and(|&at| now - at > window) {
                    self.failures.pop_front();
                }
                self.failures.push_back(now);

                if self.failures.len() >= self.config.failure_threshold as usize {
                    self.failures.clear();
                    self.phase = Phase::Open { opened_at: now };
                    true
                } else {
                    false
                }
            },
            Phase::HalfOpen { .. } => {
                self.phase = Phase::Open { opened_at: now };
                true
            },
            // A call admitted before the circuit opened finished late.
            Phase::Open { .. } => false,
        }
    }

    /// Release the half-open slot of a trial call that never completed.
    pub fn abandon_trial(&mut self) {
        if matches!(self.phase, Phase::HalfOpen { trial_in_flight: true }) {
            self.phase = Phase::HalfOpen { trial_in_flight: false };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use proptest::prelude::*;

    use super::*;

    fn breaker() -> CircuitBreaker<Instant> {
        CircuitBreaker::new(BreakerConfig::default())
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let t0 = Instant::now();
        let mut breaker = breaker();

        for i in 0..4 {
            assert_eq!(breaker.admit(t0), Ok(Admission::Pass));
            assert!(!breaker.record_failure(t0 + Duration::from_millis(i)));
        }
        assert!(breaker.record_failure(t0 + Duration::from_millis(5)));
        assert_eq!(breaker.state(), BreakerState::Open);

        // Sixth call fails fast
        let rejected = breaker.admit(t0 + Duration::from_secs(1)).unwrap_err();
        assert!(rejected.retry_after <= DEFAULT_RECOVERY_TIMEOUT);
        assert!(rejected.retry_after > Duration::from_secs(8));
    }

    #[test]
    fn success_resets_failure_count() {
        let t0 = Instant::now();
        let mut breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure(t0);
        }
        assert!(!breaker.record_success(Admission::Pass));
        assert_eq!(breaker.failure_count(), 0);
        assert!(!breaker.record_failure(t0));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failures_outside_window_expire() {
        let t0 = Instant::now();
        let mut breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure(t0);
        }
        let later = t0 + DEFAULT_FAILURE_WINDOW + Duration::from_secs(1);
        assert!(!breaker.record_failure(later));
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn single_trial_after_recovery_timeout() {
        let t0 = Instant::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(t0);
        }

        let after = t0 + DEFAULT_RECOVERY_TIMEOUT;
        assert_eq!(breaker.admit(after), Ok(Admission::Trial));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.admit(after), Err(CircuitOpen { retry_after: Duration::ZERO }));

        assert!(breaker.record_success(Admission::Trial));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(after), Ok(Admission::Pass));
    }

    #[test]
    fn late_pass_success_leaves_half_open_circuit_alone() {
        let t0 = Instant::now();
        let mut breaker = breaker();

        // Admitted while closed, still in flight when the circuit opens
        assert_eq!(breaker.admit(t0), Ok(Admission::Pass));
        for _ in 0..5 {
            breaker.record_failure(t0);
        }

        // Completes while open
        assert!(!breaker.record_success(Admission::Pass));
        assert_eq!(breaker.state(), BreakerState::Open);

        let trial_at = t0 + DEFAULT_RECOVERY_TIMEOUT;
        assert_eq!(breaker.admit(trial_at), Ok(Admission::Trial));

        // Completes while the trial is in flight
        assert!(!breaker.record_success(Admission::Pass));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.admit(trial_at).is_err(), "the trial still holds the slot");

        assert!(breaker.record_success(Admission::Trial));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_trial_reopens() {
        let t0 = Instant::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(t0);
        }

        let trial_at = t0 + DEFAULT_RECOVERY_TIMEOUT;
        assert_eq!(breaker.admit(trial_at), Ok(Admission::Trial));
        assert!(breaker.record_failure(trial_at));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.admit(trial_at + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn abandoned_trial_frees_slot() {
        let t0 = Instant::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(t0);
        }

        let trial_at = t0 + DEFAULT_RECOVERY_TIMEOUT;
        assert_eq!(breaker.admit(trial_at), Ok(Admission::Trial));
        breaker.abandon_trial();
        assert_eq!(breaker.admit(trial_at), Ok(Admission::Trial));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn never_admits_two_concurrent_trials(outcomes in prop::collection::vec(any::<bool>(), 1..64)) {
            let t0 = Instant::now();
            let mut breaker = breaker();
            let mut trials_in_flight = 0u32;

            for (step, succeed) in outcomes.into_iter().enumerate() {
                let now = t0 + Duration::from_secs(step as u64 * 4);
                let admission = match breaker.admit(now) {
                    Ok(Admission::Trial) => {
                        trials_in_flight += 1;
                        // ORACLE: half-open admits exactly one call
                        prop_assert_eq!(trials_in_flight, 1);
                        prop_assert!(breaker.admit(now).is_err());
                        Admission::Trial
                    },
                    Ok(Admission::Pass) => Admission::Pass,
                    Err(_) => continue,
                };

                if succeed {
                    breaker.record_success(admission);
                } else {
                    breaker.record_failure(now);
                }
                trials_in_flight = 0;
            }
        }
    }
}
