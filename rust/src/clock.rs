//! Time sources consumed by the generators.
//!
//! [`Clock`] hands out UUID time (100 ns ticks since 1582-10-15) and may
//! refuse when too many values are requested inside one tick of the
//! underlying wall clock. [`TimeSource`] is the plain millisecond clock used
//! by the alphanumeric generator.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::error::IdError;

/// 100 ns intervals between 1582-10-15 and 1970-01-01.
pub const GREGORIAN_OFFSET: u64 = 0x01B2_1DD2_1381_4000;

/// UUID ticks per millisecond.
pub const TICKS_PER_MILLI: u64 = 10_000;

/// Supplier of UUID timestamps.
pub trait Clock: Send + Sync {
    /// Current UUID time, or [`IdError::OverClocked`] if no fresh value is
    /// available within the current tick.
    fn uuid_time(&self) -> Result<u64, IdError>;
}

/// Supplier of wall-clock milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Convert Unix milliseconds to UUID time, clamping outside the `u64` range.
pub fn millis_to_uuid_time(millis: i64) -> u64 {
    let ticks = i128::from(millis) * i128::from(TICKS_PER_MILLI) + i128::from(GREGORIAN_OFFSET);
    u64::try_from(ticks.max(0)).unwrap_or(u64::MAX)
}

/// Convert UUID time to a UTC instant.
pub fn uuid_time_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let since_unix = i128::from(ticks) - i128::from(GREGORIAN_OFFSET);
    let secs = since_unix.div_euclid(10_000_000);
    let nanos = since_unix.rem_euclid(10_000_000) * 100;
    DateTime::from_timestamp(i64::try_from(secs).ok()?, u32::try_from(nanos).ok()?)
}

/// Convert a UTC instant to UUID time.
pub fn datetime_to_uuid_time(at: DateTime<Utc>) -> u64 {
    let ticks = i128::from(at.timestamp()) * 10_000_000
        + i128::from(at.timestamp_subsec_nanos() / 100)
        + i128::from(GREGORIAN_OFFSET);
    u64::try_from(ticks.max(0)).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct SubMilliState {
    last_millis: i64,
    issued: u64,
}

/// Wall-clock backed [`Clock`].
///
/// The system clock only resolves milliseconds, so up to
/// [`TICKS_PER_MILLI`] distinct ticks are handed out per millisecond by
/// counting through the sub-millisecond range.
#[derive(Debug, Default)]
pub struct SystemClock {
    state: Mutex<SubMilliState>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn ticks_at(&self, millis: i64) -> Result<u64, IdError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if millis != state.last_millis {
            state.last_millis = millis;
            state.issued = 0;
        } else if state.issued + 1 >= TICKS_PER_MILLI {
            return Err(IdError::OverClocked);
        } else {
            state.issued += 1;
        }
        Ok(millis_to_uuid_time(millis).saturating_add(state.issued))
    }
}

impl Clock for SystemClock {
    fn uuid_time(&self) -> Result<u64, IdError> {
        self.ticks_at(Utc::now().timestamp_millis())
    }
}

impl TimeSource for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Wall-clock backed [`TimeSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests and simulations.
///
/// Serves both traits: `now_millis` returns the configured milliseconds and
/// `uuid_time` returns the configured tick count unchanged on every call.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
    ticks: AtomicU64,
    overclocked: AtomicBool,
}

impl ManualClock {
    /// Start at `millis`, with the UUID time derived from it.
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
            ticks: AtomicU64::new(millis_to_uuid_time(millis)),
            overclocked: AtomicBool::new(false),
        }
    }

    /// Move both readings to `millis`.
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
        self.ticks.store(millis_to_uuid_time(millis), Ordering::SeqCst);
    }

    /// Shift both readings by `delta` milliseconds (negative rewinds).
    pub fn advance_millis(&self, delta: i64) {
        let next = self.millis.load(Ordering::SeqCst).wrapping_add(delta);
        self.set_millis(next);
    }

    /// Override only the UUID time.
    pub fn set_uuid_time(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Make `uuid_time` fail with [`IdError::OverClocked`] while set.
    pub fn set_overclocked(&self, overclocked: bool) {
        self.overclocked.store(overclocked, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn uuid_time(&self) -> Result<u64, IdError> {
        if self.overclocked.load(Ordering::SeqCst) {
            return Err(IdError::OverClocked);
        }
        Ok(self.ticks.load(Ordering::SeqCst))
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
