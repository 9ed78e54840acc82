//! Timestamps, clocks and the best-before window arithmetic
use chrono::{DateTime, SubsecRound, TimeDelta, TimeZone, Utc};
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicI64, Ordering};

const MILLIS_PER_MINUTE: i64 = 60 * 1000;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;

/// A UTC instant with millisecond precision. Stored as integer milliseconds
/// since the Unix epoch so comparisons at boundary instants are exact.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now().trunc_subsecs(3))
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// `None` when the result falls outside the representable range.
    pub fn checked_add(&self, rhs: TimeDelta) -> Option<Self> {
        self.0.checked_add_signed(rhs).map(Self)
    }
    pub fn checked_sub(&self, rhs: TimeDelta) -> Option<Self> {
        self.0.checked_sub_signed(rhs).map(Self)
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value.trunc_subsecs(3))
    }
}

// The operators panic on overflow. Deltas that come from callers or config go
// through `checked_add` / `checked_sub`.
impl Add<TimeDelta> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: TimeDelta) -> Self::Output {
        TimeStamp(self.0 + rhs)
    }
}

impl Sub<TimeDelta> for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: TimeDelta) -> Self::Output {
        TimeStamp(self.0 - rhs)
    }
}

impl Sub for TimeStamp {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeStamp) -> Self::Output {
        self.0 - rhs.0
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.as_millis())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let millis = d.i64()?;

        TimeStamp::from_millis(millis).ok_or(minicbor::decode::Error::message(
            "timestamp millis out of range for utc",
        ))
    }
}

/// Source of "now". Every time-dependent rule reads the clock through this
/// trait so tests can pin the instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimeStamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }
    pub fn set(&self, to: TimeStamp) {
        self.millis.store(to.as_millis(), Ordering::SeqCst);
    }
    pub fn advance(&self, by: TimeDelta) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp {
        let millis = self.millis.load(Ordering::SeqCst);
        // only ever stores values that came from a valid TimeStamp
        TimeStamp::from_millis(millis).unwrap_or_else(TimeStamp::now)
    }
}

/// Remaining shelf life of a listing at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub is_expired: bool,
    remaining_ms: i64,
}

impl TimeWindow {
    /// Remaining time, clamped at zero.
    pub fn remaining(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.remaining_ms)
    }
    pub fn remaining_millis(&self) -> i64 {
        self.remaining_ms
    }
    pub fn whole_hours(&self) -> i64 {
        self.remaining_ms / MILLIS_PER_HOUR
    }
    /// Minutes left over after the whole hours.
    pub fn remainder_minutes(&self) -> i64 {
        (self.remaining_ms % MILLIS_PER_HOUR) / MILLIS_PER_MINUTE
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_expired {
            return write!(f, "Expired");
        }
        write!(f, "{}h {}m", self.whole_hours(), self.remainder_minutes())
    }
}

/// Computes the window between `now` and `best_before`. A window of zero or
/// less is expired.
pub fn time_window(best_before: &TimeStamp, now: &TimeStamp) -> TimeWindow {
    let diff = best_before.as_millis() - now.as_millis();

    if diff <= 0 {
        TimeWindow {
            is_expired: true,
            remaining_ms: 0,
        }
    } else {
        TimeWindow {
            is_expired: false,
            remaining_ms: diff,
        }
    }
}

/// Signed hours until `best_before`; negative once it has passed.
pub fn hours_left(best_before: &TimeStamp, now: &TimeStamp) -> f64 {
    let diff = best_before.as_millis() - now.as_millis();
    diff as f64 / MILLIS_PER_HOUR as f64
}
