//! Circuit breaker
//!
//! Every backend resource carries one breaker. The breaker is lock-free:
//! a monotonic failure counter and the epoch second of the last failure,
//! both atomics. State is derived from those two values and the process
//! tunables at read time, never stored, so there is no transition race.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Failures at which a breaker opens. Process-wide tunable.
static MAX_FAILURES: AtomicU32 = AtomicU32::new(12);

/// Seconds without a new failure after which an open breaker permits a
/// probe. Process-wide tunable.
static CALM_SECS: AtomicU64 = AtomicU64::new(90);

/// Set the process-wide failure threshold.
pub fn set_max_failures(n: u32) {
    MAX_FAILURES.store(n, Ordering::Relaxed);
}

/// The current process-wide failure threshold.
pub fn max_failures() -> u32 {
    MAX_FAILURES.load(Ordering::Relaxed)
}

/// Set the process-wide calm threshold: how long an open breaker must sit
/// without new failures before the next attempt becomes a probe.
pub fn set_calm_duration(d: Duration) {
    CALM_SECS.store(d.as_secs(), Ordering::Relaxed);
}

/// The current process-wide calm threshold.
pub fn calm_duration() -> Duration {
    Duration::from_secs(CALM_SECS.load(Ordering::Relaxed))
}

/// Derived breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Fewer failures than the threshold; attempts pass through.
    Closed,
    /// Threshold reached and the last failure is recent; skip the resource
    /// without a network attempt.
    Open,
    /// Threshold reached but the calm period has elapsed; the next attempt
    /// is a probe. On probe success the caller invokes [`CircuitBreaker::reset`].
    HalfOpen,
}

/// Per-resource failure accounting.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    last_failure_unix: AtomicU64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    /// A closed breaker. The initial last-failure timestamp is epoch
    /// second 1, i.e. calm since forever.
    pub fn new() -> Self {
        CircuitBreaker {
            failures: AtomicU32::new(0),
            last_failure_unix: AtomicU64::new(1),
        }
    }

    /// The monotonic failure count. Successes never decrement it; only
    /// [`CircuitBreaker::reset`] clears it.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Record one failure and stamp it. Returns the recorded epoch second.
    pub fn record_failure(&self) -> u64 {
        let now = unix_now();
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_unix.store(now, Ordering::Relaxed);
        now
    }

    /// Successes do not decay the counter; only elapsed calm time does.
    /// Present so call sites read symmetrically.
    pub fn record_success(&self) {}

    /// Clear the counter after a successful half-open probe.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Derive the state and report the last failure time.
    pub fn state(&self) -> (BreakerState, SystemTime) {
        let failures = self.failures.load(Ordering::Relaxed);
        let last = self.last_failure_unix.load(Ordering::Relaxed);
        let last_time = UNIX_EPOCH + Duration::from_secs(last);

        if failures < max_failures() {
            return (BreakerState::Closed, last_time);
        }
        let elapsed = unix_now().saturating_sub(last);
        if elapsed < CALM_SECS.load(Ordering::Relaxed) {
            (BreakerState::Open, last_time)
        } else {
            (BreakerState::HalfOpen, last_time)
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
