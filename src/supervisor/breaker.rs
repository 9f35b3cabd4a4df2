//! Three-state circuit breaker gating calls to the external binary.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────> Open
//!     ^                                  │ reset timeout elapsed,
//!     │ trial succeeds                   │ next caller admitted
//!     │                                  v
//!     └──────────────────────────── HalfOpen ── trial fails ──> Open
//! ```
//!
//! HalfOpen admits exactly one trial at a time; every other caller is
//! rejected as if the breaker were Open.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::types::{CircuitState, SupervisorEvent};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerCounters {
    pub consecutive_failures: u32,
    pub last_transition_at: Instant,
}

/// Proof of admission returned by [`CircuitBreaker::admit`].
///
/// Only a trial permit can resolve HalfOpen. Dropping a trial permit
/// without recording an outcome frees the trial slot, so a caller that is
/// cancelled mid-flight never wedges the breaker.
#[must_use = "dropping a trial permit abandons the trial"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial, true);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial, false);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            tracing::debug!("trial abandoned without an outcome");
            self.breaker.abandon_trial();
        }
    }
}

impl std::fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    counters: BreakerCounters,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, events: broadcast::Sender<SupervisorEvent>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                counters: BreakerCounters {
                    consecutive_failures: 0,
                    last_transition_at: Instant::now(),
                },
                trial_in_flight: false,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a new attempt may proceed.
    ///
    /// In Open, the first caller after the reset timeout moves the breaker
    /// to HalfOpen and becomes the single trial. Its outcome must then be
    /// reported through [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow_request(&self) -> bool {
        self.try_admit().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), but returns a guard
    /// that carries the outcome back and knows whether it is the trial.
    pub fn admit(&self) -> Option<Permit<'_>> {
        self.try_admit().map(|trial| Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// `Some(is_trial)` when admitted.
    fn try_admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                if inner.counters.last_transition_at.elapsed() >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    /// Report a success for a caller admitted via `allow_request`. While
    /// HalfOpen this is taken as the trial's outcome.
    pub fn record_success(&self) {
        let trial = self.state() == CircuitState::HalfOpen;
        self.settle(trial, true);
    }

    /// Report a failure for a caller admitted via `allow_request`. While
    /// HalfOpen this is taken as the trial's outcome.
    pub fn record_failure(&self) {
        let trial = self.state() == CircuitState::HalfOpen;
        self.settle(trial, false);
    }

    fn settle(&self, trial: bool, success: bool) {
        let mut inner = self.lock();
        match (inner.state, trial, success) {
            (CircuitState::HalfOpen, true, true) => {
                inner.counters.consecutive_failures = 0;
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (CircuitState::HalfOpen, true, false) => {
                inner.counters.consecutive_failures += 1;
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            // Stragglers admitted before the breaker opened: any success
            // resets the count, but only the trial or the reset timeout
            // moves the state.
            (_, _, true) => inner.counters.consecutive_failures = 0,
            (CircuitState::HalfOpen, false, false) => {
                inner.counters.consecutive_failures += 1;
            }
            (CircuitState::Closed, _, false) => {
                inner.counters.consecutive_failures += 1;
                if inner.counters.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::Open, _, false) => {
                tracing::debug!("ignoring failure reported while circuit is open");
            }
        }
    }

    /// Release the HalfOpen trial slot without an outcome, e.g. when the
    /// admitted command was cancelled before it ever ran.
    pub fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().counters.consecutive_failures
    }

    pub fn counters(&self) -> BreakerCounters {
        self.lock().counters
    }

    /// Time left before an Open breaker admits a trial; zero otherwise.
    pub fn retry_after(&self) -> Duration {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open => self
                .config
                .reset_timeout
                .saturating_sub(inner.counters.last_transition_at.elapsed()),
            CircuitState::Closed | CircuitState::HalfOpen => Duration::ZERO,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        inner.counters.last_transition_at = Instant::now();

        let consecutive_failures = inner.counters.consecutive_failures;
        match next {
            CircuitState::Open => tracing::warn!(
                %previous,
                %next,
                consecutive_failures,
                "circuit opened"
            ),
            _ => tracing::info!(%previous, %next, consecutive_failures, "circuit state changed"),
        }
        // No subscribers is fine; the event is advisory.
        let _ = self.events.send(SupervisorEvent::StateChange {
            previous,
            next,
            consecutive_failures,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> (CircuitBreaker, broadcast::Receiver<SupervisorEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let config = BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        };
        (CircuitBreaker::new(config, tx), rx)
    }

    fn transitions(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<(CircuitState, CircuitState)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SupervisorEvent::StateChange { previous, next, .. } = event {
                out.push((previous, next));
            }
        }
        out
    }

    #[test]
    fn default_config_values() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn opens_exactly_at_threshold() {
        let (cb, mut rx) = breaker(5, 60_000);
        for _ in 0..4 {
            assert!(cb.allow_request());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 4);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(
            transitions(&mut rx),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count_while_closed() {
        let (cb, _rx) = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_trial_then_closes_on_success() {
        let (cb, mut rx) = breaker(1, 1_000);
        cb.record_failure();
        assert!(!cb.allow_request());
        assert_eq!(cb.retry_after(), Duration::from_millis(1_000));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // A concurrent caller is rejected while the trial is pending.
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.allow_request());
        assert_eq!(
            transitions(&mut rx),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_restarts_timer() {
        let (cb, _rx) = breaker(2, 500);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 3);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!cb.allow_request());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn admit_marks_the_trial_caller() {
        let (cb, _rx) = breaker(1, 100);
        let regular = cb.admit().unwrap();
        assert!(!regular.is_trial());
        regular.record_failure();
        assert!(cb.admit().is_none());

        tokio::time::advance(Duration::from_millis(100)).await;
        let trial = cb.admit().unwrap();
        assert!(trial.is_trial());
        assert!(cb.admit().is_none());
        trial.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_permit_frees_the_slot() {
        let (cb, _rx) = breaker(1, 100);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        let trial = cb.admit().unwrap();
        assert!(trial.is_trial());
        assert!(cb.admit().is_none());
        drop(trial);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let next = cb.admit().unwrap();
        assert!(next.is_trial());
        next.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_trial_resolves_half_open() {
        let (cb, mut rx) = breaker(1, 100);
        let straggler = cb.admit().unwrap();
        let failing = cb.admit().unwrap();
        failing.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        let trial = cb.admit().unwrap();
        assert!(trial.is_trial());

        // Straggler from the Closed period finishes while the trial runs.
        straggler.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.admit().is_none());

        trial.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            transitions(&mut rx),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Open),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_trial_failure_in_half_open_only_counts() {
        let (cb, _rx) = breaker(1, 100);
        let straggler = cb.admit().unwrap();
        cb.admit().unwrap().record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        let trial = cb.admit().unwrap();

        straggler.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.consecutive_failures(), 2);

        trial.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_the_slot() {
        let (cb, _rx) = breaker(1, 100);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.abandon_trial();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn open_ignores_straggler_failures_and_keeps_state_on_success() {
        let (cb, _rx) = breaker(2, 10_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_failure();
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn state_change_event_carries_failure_count() {
        let (cb, mut rx) = breaker(2, 100);
        cb.record_failure();
        cb.record_failure();
        match rx.try_recv().unwrap() {
            SupervisorEvent::StateChange {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 2),
            other => panic!("Expected StateChange, got {:?}", other),
        }
    }
}
