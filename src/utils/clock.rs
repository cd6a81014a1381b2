//! Wall-clock access and second-based time arithmetic

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current wall-clock time.
///
/// Every component that reasons about elapsed time reads the clock through
/// this trait so suspension gaps can be simulated in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock pinned to a fixed, arbitrary instant
    pub fn at_epoch() -> Self {
        Self::new(DateTime::from_timestamp(1_750_000_000, 0).unwrap_or_default())
    }

    pub fn advance_secs(&self, secs: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now = add_secs(*now, secs);
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// Seconds from `earlier` to `later` (negative if `later` is before `earlier`)
pub fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

/// Shift an instant by a (possibly fractional or negative) number of seconds
pub fn add_secs(instant: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    instant + Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_between_is_signed() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();
        clock.advance_secs(12.5);
        assert_eq!(secs_between(start, clock.now()), 12.5);
        assert_eq!(secs_between(clock.now(), start), -12.5);
    }

    #[test]
    fn test_add_secs_round_trips_with_secs_between() {
        let clock = ManualClock::at_epoch();
        let shifted = add_secs(clock.now(), 90.0);
        assert_eq!(secs_between(clock.now(), shifted), 90.0);
    }
}
