//! Time source and the millisecond encoding used for every stored timestamp.

use std::sync::{Mutex, PoisonError};

use time::{Duration, OffsetDateTime};

use crate::error::RepoError;

pub trait Clock: Send + Sync {
    /// Current UTC time, truncated to whole milliseconds.
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        truncate_millis(OffsetDateTime::now_utc())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(truncate_millis(start)),
        }
    }

    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = truncate_millis(to);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = truncate_millis(*now + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn truncate_millis(ts: OffsetDateTime) -> OffsetDateTime {
    let nanos = ts.nanosecond();
    ts - Duration::nanoseconds(i64::from(nanos % 1_000_000))
}

pub(crate) fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64) -> Result<OffsetDateTime, RepoError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| RepoError::Corrupt(format!("timestamp {ms}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn millis_roundtrip_drops_sub_millisecond_part() {
        let ts = datetime!(2024-03-01 12:30:45.123456789 UTC);
        let back = from_millis(to_millis(ts)).expect("in range");
        assert_eq!(back, datetime!(2024-03-01 12:30:45.123 UTC));
        assert_eq!(truncate_millis(ts), back);
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:00 UTC));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:05 UTC));
        clock.set(datetime!(2030-06-01 08:00 UTC));
        assert_eq!(clock.now(), datetime!(2030-06-01 08:00 UTC));
    }

    #[test]
    fn out_of_range_millis_is_corrupt() {
        assert!(matches!(from_millis(i64::MAX), Err(RepoError::Corrupt(_))));
    }
}
