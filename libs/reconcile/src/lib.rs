//! Liveness and retry bookkeeping primitives.
//!
//! This library provides the small stateful helpers the orchestrator uses to
//! judge isolates over time:
//!
//! - **Timestamps**: a monotonic millisecond clock value supplied by the caller,
//!   so every decision is reproducible from the event sequence alone.
//! - **Decaying counters**: crash counts that halve every half-life.
//! - **Rolling averages**: command-acknowledgement latency over a window.
//! - **Backoff and restart tracking**: how long to wait before asking for a
//!   restart, and when to give up.
//!
//! # Invariants
//!
//! - Nothing here reads the wall clock; time always comes in as an argument
//! - Decayed values never increase without an explicit increment

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// =============================================================================
// Timestamp
// =============================================================================

/// Monotonic timestamp in milliseconds since an arbitrary origin.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The origin.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Creates a timestamp from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Returns the value in milliseconds.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    #[must_use]
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Returns this timestamp advanced by `d`.
    #[must_use]
    pub fn saturating_add(&self, d: Duration) -> Timestamp {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(ms))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// =============================================================================
// Decaying Counter
// =============================================================================

/// A counter whose value halves every `half_life`.
///
/// The value is stored as of a reference timestamp and decayed lazily when
/// read, so a single crash long ago contributes almost nothing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DecayingCounter {
    value: f64,
    as_of: Timestamp,
}

impl DecayingCounter {
    /// Create an empty counter.
    pub fn new(now: Timestamp) -> Self {
        Self {
            value: 0.0,
            as_of: now,
        }
    }

    /// Decayed value at `now`.
    ///
    /// A zero half-life disables decay. Reading before the reference
    /// timestamp returns the stored value.
    pub fn value_at(&self, now: Timestamp, half_life: Duration) -> f64 {
        if half_life.is_zero() || self.value == 0.0 {
            return self.value;
        }
        let elapsed = now.saturating_since(self.as_of).as_secs_f64();
        self.value * 0.5_f64.powf(elapsed / half_life.as_secs_f64())
    }

    /// Materialize the decayed value at `now` and move the reference there.
    pub fn rebase(&mut self, now: Timestamp, half_life: Duration) {
        if now > self.as_of {
            self.value = self.value_at(now, half_life);
            self.as_of = now;
        }
    }

    /// Add one event at `now`.
    pub fn increment(&mut self, now: Timestamp, half_life: Duration) {
        self.rebase(now, half_life);
        self.value += 1.0;
    }

    /// Timestamp the stored value refers to.
    pub fn as_of(&self) -> Timestamp {
        self.as_of
    }
}

// =============================================================================
// Rolling Average
// =============================================================================

/// Rolling average of the last `window` latency samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingAverage {
    window: usize,
    samples: VecDeque<Duration>,
}

impl RollingAverage {
    /// Create an empty average over `window` samples (at least one).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Record a sample, evicting the oldest when the window is full.
    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the recorded samples, or `None` with no samples.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Number of samples currently recorded.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no samples are recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    #[serde(with = "duration_ms")]
    pub base: Duration,

    /// Maximum delay.
    #[serde(with = "duration_ms")]
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX).min(32);
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = if jitter > 0.0 {
            let spread = delay * jitter;
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Restart policy for supervised isolates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Maximum restart attempts within the window.
    pub max_restarts: u32,

    /// Time window for counting restarts.
    #[serde(with = "duration_ms")]
    pub window: Duration,

    /// Backoff policy for restarts.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            window: DEFAULT_RESTART_WINDOW,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome of recording a restart attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` counts attempts inside the window.
    Restart { attempt: u32, delay: Duration },

    /// Too many restarts inside the window.
    Exhausted { attempts: u32 },
}

/// Tracks restart attempts per key inside a sliding window.
#[derive(Debug, Clone)]
pub struct RestartTracker<K: Ord> {
    policy: RestartPolicy,

    /// Tracked attempts: key -> timestamps inside the window.
    attempts: BTreeMap<K, Vec<Timestamp>>,
}

impl<K: Ord + Clone> RestartTracker<K> {
    /// Create a new restart tracker.
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: BTreeMap::new(),
        }
    }

    /// Record a restart attempt for `key` at `now`.
    pub fn record(&mut self, key: &K, now: Timestamp) -> RestartDecision {
        let window = self.policy.window;
        let stamps = self.attempts.entry(key.clone()).or_default();
        stamps.retain(|t| now.saturating_since(*t) < window);

        let attempts = stamps.len() as u32;
        if attempts >= self.policy.max_restarts {
            return RestartDecision::Exhausted { attempts };
        }

        stamps.push(now);
        RestartDecision::Restart {
            attempt: attempts + 1,
            delay: self.policy.backoff.delay(attempts),
        }
    }

    /// Check if restarts are exhausted for `key` at `now`.
    pub fn is_exhausted(&self, key: &K, now: Timestamp) -> bool {
        let Some(stamps) = self.attempts.get(key) else {
            return false;
        };
        let recent = stamps
            .iter()
            .filter(|t| now.saturating_since(**t) < self.policy.window)
            .count();
        recent as u32 >= self.policy.max_restarts
    }

    /// Clear tracking for `key`.
    pub fn clear(&mut self, key: &K) {
        self.attempts.remove(key);
    }

    /// Drop keys with no attempt inside the window.
    pub fn prune(&mut self, now: Timestamp) {
        let window = self.policy.window;
        self.attempts.retain(|_, stamps| {
            stamps.retain(|t| now.saturating_since(*t) < window);
            !stamps.is_empty()
        });
    }
}

/// Default maximum restarts inside the window.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default restart window.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_decaying_counter_halves() {
        let mut counter = DecayingCounter::new(Timestamp::ZERO);
        counter.increment(Timestamp::ZERO, HOUR);
        counter.increment(Timestamp::ZERO, HOUR);

        assert_eq!(counter.value_at(Timestamp::ZERO, HOUR), 2.0);
        let later = Timestamp::from_secs(3600);
        assert!((counter.value_at(later, HOUR) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decaying_counter_zero_half_life_keeps_value() {
        let mut counter = DecayingCounter::new(Timestamp::ZERO);
        counter.increment(Timestamp::ZERO, Duration::ZERO);
        assert_eq!(
            counter.value_at(Timestamp::from_secs(1_000_000), Duration::ZERO),
            1.0
        );
    }

    #[test]
    fn test_decaying_counter_rebase_preserves_value() {
        let mut counter = DecayingCounter::new(Timestamp::ZERO);
        counter.increment(Timestamp::ZERO, HOUR);
        let t = Timestamp::from_secs(1800);
        let before = counter.value_at(t, HOUR);
        counter.rebase(t, HOUR);
        assert_eq!(counter.as_of(), t);
        assert!((counter.value_at(t, HOUR) - before).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_average_window() {
        let mut avg = RollingAverage::new(2);
        assert_eq!(avg.average(), None);

        avg.push(Duration::from_millis(10));
        avg.push(Duration::from_millis(30));
        assert_eq!(avg.average(), Some(Duration::from_millis(20)));

        avg.push(Duration::from_millis(50));
        assert_eq!(avg.len(), 2);
        assert_eq!(avg.average(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        };

        // Exponential growth, within jitter bounds
        assert!(policy.delay(0) <= Duration::from_millis(125));
        assert!(policy.delay(1) <= Duration::from_millis(250));
        assert!(policy.delay(2) >= Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_restart_tracker_exhausts_within_window() {
        let policy = RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(60),
            backoff: BackoffPolicy {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
                jitter: 0.0,
            },
        };
        let mut tracker = RestartTracker::new(policy);
        let key = "iso-A".to_string();

        assert_eq!(
            tracker.record(&key, Timestamp::from_secs(0)),
            RestartDecision::Restart {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            tracker.record(&key, Timestamp::from_secs(1)),
            RestartDecision::Restart {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(
            tracker.record(&key, Timestamp::from_secs(2)),
            RestartDecision::Exhausted { attempts: 2 }
        );
        assert!(tracker.is_exhausted(&key, Timestamp::from_secs(2)));

        // Outside the window the budget is available again
        assert!(!tracker.is_exhausted(&key, Timestamp::from_secs(120)));
        assert!(matches!(
            tracker.record(&key, Timestamp::from_secs(120)),
            RestartDecision::Restart { attempt: 1, .. }
        ));

        tracker.clear(&key);
        assert!(!tracker.is_exhausted(&key, Timestamp::from_secs(120)));
    }

    proptest! {
        #[test]
        fn prop_decay_never_increases(elapsed in 0u64..10_000_000, count in 1u32..20) {
            let half_life = Duration::from_secs(600);
            let mut counter = DecayingCounter::new(Timestamp::ZERO);
            for _ in 0..count {
                counter.increment(Timestamp::ZERO, half_life);
            }
            let now = counter.value_at(Timestamp::ZERO, half_life);
            let later = counter.value_at(Timestamp::from_millis(elapsed), half_life);
            prop_assert!(later <= now);
            prop_assert!(later >= 0.0);
        }
    }
}
