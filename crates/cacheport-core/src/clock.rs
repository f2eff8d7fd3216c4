//! Time source for entry expiry.
//!
//! Stores that compute expiration themselves take a `Clock` so that tests can
//! move time forward without sleeping.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Expiry instant for a TTL in seconds; `0` means the entry never expires.
pub(crate) fn expiry_after(clock: &dyn Clock, ttl_secs: u64) -> Option<DateTime<Utc>> {
    if ttl_secs == 0 {
        return None;
    }
    let at = i64::try_from(ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| clock.now().checked_add_signed(delta));
    Some(at.unwrap_or(DateTime::<Utc>::MAX_UTC))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_all_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();

        other.advance_secs(5);
        assert_eq!(clock.now() - start, Duration::seconds(5));
    }

    #[test]
    fn test_expiry_after() {
        let clock = ManualClock::new();
        assert!(expiry_after(&clock, 0).is_none());

        let at = expiry_after(&clock, 60).unwrap();
        assert_eq!(at - clock.now(), Duration::seconds(60));
    }

    #[test]
    fn test_expiry_after_saturates() {
        let clock = ManualClock::new();
        assert_eq!(expiry_after(&clock, u64::MAX), Some(DateTime::<Utc>::MAX_UTC));
    }
}
