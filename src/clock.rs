//! Time sources for scheduling and audit
//!
//! Two clocks with distinct jobs: the monotonic clock measures durations and
//! never goes backward; the wall clock positions cross-node target instants
//! and is only as good as the hosts' time sync. All coordinated transport
//! scheduling uses wall-clock microseconds.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as microseconds since the Unix epoch
#[must_use]
pub fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Current wall-clock time as seconds since the Unix epoch.
///
/// This is the representation used on the transport wire (OSC doubles).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn wall_seconds() -> f64 {
    wall_micros() as f64 / 1_000_000.0
}

/// Convert wire seconds to scheduler microseconds
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn seconds_to_micros(seconds: f64) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * 1_000_000.0) as u64
}

/// Convert scheduler microseconds to wire seconds
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn micros_to_seconds(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

/// Monotonic clock for measuring durations
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Create a clock anchored at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since this clock was created
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Raw instant for interval arithmetic
    #[must_use]
    pub fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_micros_is_plausible() {
        // Sometime after 2020-01-01 and before 2100
        let now = wall_micros();
        assert!(now > 1_577_836_800_000_000);
        assert!(now < 4_102_444_800_000_000);
    }

    #[test]
    fn seconds_round_trip() {
        let micros = 1_722_500_000_123_456_u64;
        let secs = micros_to_seconds(micros);
        let back = seconds_to_micros(secs);
        // f64 has ~0.2us resolution at epoch scale; allow 1us
        assert!(back.abs_diff(micros) <= 1);
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        assert_eq!(seconds_to_micros(-5.0), 0);
    }

    #[test]
    fn monotonic_never_goes_backward() {
        let clock = MonotonicClock::new();
        let a = clock.elapsed();
        let b = clock.elapsed();
        assert!(b >= a);
    }
}
