//! Time-based alphanumeric identifiers.
//!
//! Format: `<time13><postfixP>`, all lowercase base-36, fixed length
//! `13 + P` per generator.
//!
//! The time segment is `now - offset` in milliseconds, computed on the
//! unsigned 64-bit ring and written as 13 base-36 digits, so the lexical
//! order of ids follows the ring position even when the signed difference
//! would have overflowed. A generator follows its position past the end of
//! the ring onto the next lap (13 digits have room for nine of them), so
//! ids keep increasing after the ring wraps through zero. The postfix counts
//! identifiers issued within the same millisecond.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::random_range;
use regex::Regex;
use tracing::warn;

use crate::clock::{SystemTimeSource, TimeSource};
use crate::encoding::{
    MAX_TIME_DIGITS, base36_capacity, decode_base36, decode_base36_wide, encode_base36,
    encode_base36_wide,
};
use crate::error::IdError;

/// Postfix width used by [`TimeBasedAlphanumericGen::default_params`].
pub const DEFAULT_POSTFIX_DIGITS: usize = 3;

/// Upper bound (exclusive, in ms) of the random shift applied to a default
/// offset, so that instances created together sit at different ring
/// positions.
const OFFSET_SPREAD: i64 = 1 << 40;

/// Largest time segment that fits in [`MAX_TIME_DIGITS`] digits.
const MAX_POSITION: u128 = 36u128.pow(MAX_TIME_DIGITS as u32) - 1;

static ID_PATTERN_P3: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9a-z]{13})([0-9a-z]{3})$").unwrap());

fn build_pattern(postfix_digits: usize) -> Regex {
    let pattern = format!(
        r"^([0-9a-z]{{{}}})([0-9a-z]{{{}}})$",
        MAX_TIME_DIGITS, postfix_digits
    );
    Regex::new(&pattern).unwrap()
}

/// Parsed alphanumeric id components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAlphanumericId {
    pub raw: String,
    /// Ring position of the time segment (ms since the generator's offset),
    /// folded back onto the 64-bit ring.
    pub elapsed: u64,
    pub postfix: u64,
}

impl ParsedAlphanumericId {
    /// Wall-clock milliseconds the id was generated at, given the
    /// generator's offset.
    pub fn millis(&self, offset: i64) -> i64 {
        (offset as u64).wrapping_add(self.elapsed) as i64
    }
}

/// Parse an id produced by a generator with `postfix_digits` postfix digits.
pub fn parse_alphanumeric_id(
    id: &str,
    postfix_digits: usize,
) -> Result<ParsedAlphanumericId, IdError> {
    check_postfix(postfix_digits)?;
    let pattern = if postfix_digits == DEFAULT_POSTFIX_DIGITS {
        &*ID_PATTERN_P3
    } else {
        &build_pattern(postfix_digits)
    };
    let caps = pattern
        .captures(id)
        .ok_or_else(|| IdError::InvalidArgument(format!("malformed alphanumeric id: {id}")))?;

    let elapsed = decode_base36_wide(&caps[1])? as u64;
    let postfix = match caps.get(2).map(|m| m.as_str()) {
        Some(p) if !p.is_empty() => decode_base36(p)?,
        _ => 0,
    };

    Ok(ParsedAlphanumericId {
        raw: id.to_string(),
        elapsed,
        postfix,
    })
}

/// Validate an id produced by a generator with `postfix_digits` postfix digits.
pub fn validate_alphanumeric_id(id: &str, postfix_digits: usize) -> bool {
    parse_alphanumeric_id(id, postfix_digits).is_ok()
}

/// Recover the generation time (Unix ms) of `id`, issued by a generator
/// whose offset was `offset`.
///
/// Only the leading 13 characters are read, so the postfix width need not
/// be known. Exact inverse of the generator's ring subtraction.
pub fn millis_from_id(id: &str, offset: i64) -> Result<i64, IdError> {
    let time = id
        .get(..MAX_TIME_DIGITS)
        .ok_or_else(|| IdError::InvalidArgument(format!("id too short: {id}")))?;
    let elapsed = decode_base36_wide(time)? as u64;
    Ok((offset as u64).wrapping_add(elapsed) as i64)
}

fn check_postfix(postfix_digits: usize) -> Result<(), IdError> {
    if postfix_digits > MAX_TIME_DIGITS {
        return Err(IdError::InvalidArgument(format!(
            "postfix digits must be within 0..={MAX_TIME_DIGITS}, got {postfix_digits}"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct TickState {
    /// Time segment of the last id; laps past the 64-bit ring stay counted.
    position: Option<u128>,
    counter: u64,
}

/// Where a fresh reading of the ring lands relative to `last`, or `None`
/// when it does not move forward or would overflow the time segment.
///
/// The reading is taken to be the nearer of the two ring directions, so a
/// backward clock step stalls while a step across zero opens the next lap.
fn advance(last: u128, ring: u64) -> Option<u128> {
    let step = ring.wrapping_sub(last as u64) as i64;
    if step <= 0 {
        return None;
    }
    let position = last + step as u128;
    (position <= MAX_POSITION).then_some(position)
}

/// Generator of fixed-length, lexically sortable base-36 identifiers.
///
/// `next_id` takes `&self`; the `(position, counter)` pair is updated
/// under one lock, so a shared instance hands out a gap-free postfix
/// sequence per millisecond.
pub struct TimeBasedAlphanumericGen {
    postfix_digits: usize,
    offset: i64,
    max_postfix: u64,
    time: Arc<dyn TimeSource>,
    tick: Mutex<TickState>,
}

impl TimeBasedAlphanumericGen {
    /// Generator on the system clock with a default offset.
    ///
    /// With no postfix the offset is the current time. Otherwise it is the
    /// current time shifted back by a random amount, which keeps separately
    /// created instances from issuing the same ids. That separation is
    /// probabilistic only.
    pub fn new(postfix_digits: usize) -> Result<Self, IdError> {
        Self::with_time_source(postfix_digits, None, Arc::new(SystemTimeSource))
    }

    /// Generator on the system clock with an explicit offset (Unix ms).
    pub fn with_offset(postfix_digits: usize, offset: i64) -> Result<Self, IdError> {
        Self::with_time_source(postfix_digits, Some(offset), Arc::new(SystemTimeSource))
    }

    /// Generator reading time from `time`.
    pub fn with_time_source(
        postfix_digits: usize,
        offset: Option<i64>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, IdError> {
        check_postfix(postfix_digits)?;
        let offset = offset.unwrap_or_else(|| {
            let now = time.now_millis();
            if postfix_digits == 0 {
                now
            } else {
                now.wrapping_sub(random_range(0..OFFSET_SPREAD))
            }
        });

        Ok(Self {
            postfix_digits,
            offset,
            max_postfix: base36_capacity(postfix_digits),
            time,
            tick: Mutex::new(TickState::default()),
        })
    }

    /// Generator with three postfix digits on the system clock.
    pub fn default_params() -> Self {
        Self::new(DEFAULT_POSTFIX_DIGITS).expect("default parameters should always be valid")
    }

    /// Generate the next id.
    ///
    /// Fails with [`IdError::CapacityExhausted`] once every postfix value of
    /// the current millisecond is used; the generator recovers as soon as
    /// time moves on. A clock that steps backwards keeps the previous time
    /// segment until it catches up, so ids never sort before earlier ones
    /// from the same instance.
    pub fn next_id(&self) -> Result<String, IdError> {
        let now = self.time.now_millis();
        let ring = (now as u64).wrapping_sub(self.offset as u64);

        let (position, counter) = {
            let mut tick = self.tick.lock().unwrap_or_else(|e| e.into_inner());
            let reading = match tick.position {
                None => Ok(u128::from(ring)),
                Some(last) => advance(last, ring).ok_or(last),
            };
            match reading {
                Ok(position) => {
                    if tick.position.is_some_and(|last| last >> 64 != position >> 64) {
                        warn!(
                            target: "idgen.alphanumeric",
                            lap = (position >> 64) as u64,
                            "time segment wrapped past the 64-bit ring"
                        );
                    }
                    tick.position = Some(position);
                    tick.counter = 0;
                    (position, 0)
                }
                Err(last) => {
                    let next = tick
                        .counter
                        .checked_add(1)
                        .filter(|n| *n <= self.max_postfix)
                        .ok_or_else(|| {
                            warn!(
                                target: "idgen.alphanumeric",
                                postfix_digits = self.postfix_digits,
                                position = %last,
                                "postfix space exhausted"
                            );
                            IdError::CapacityExhausted {
                                postfix_digits: self.postfix_digits,
                            }
                        })?;
                    tick.counter = next;
                    (last, next)
                }
            }
        };

        let mut id = encode_base36_wide(position, MAX_TIME_DIGITS);
        id.push_str(&encode_base36(counter, self.postfix_digits));
        Ok(id)
    }

    /// Generate `n` ids, stopping at the first failure.
    pub fn next_n(&self, n: usize) -> Result<Vec<String>, IdError> {
        (0..n).map(|_| self.next_id()).collect()
    }

    /// Generation time (Unix ms) of an id from this generator.
    pub fn millis_from(&self, id: &str) -> Result<i64, IdError> {
        millis_from_id(id, self.offset)
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn postfix_digits(&self) -> usize {
        self.postfix_digits
    }

    pub fn max_length(&self) -> usize {
        MAX_TIME_DIGITS + self.postfix_digits
    }

    pub fn min_length(&self) -> usize {
        self.max_length()
    }
}

impl Iterator for TimeBasedAlphanumericGen {
    type Item = Result<String, IdError>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::thread;

    const T0: i64 = 1_771_000_000_000;

    fn manual(postfix: usize, offset: i64) -> (Arc<ManualClock>, TimeBasedAlphanumericGen) {
        let clock = Arc::new(ManualClock::new(T0));
        let generator =
            TimeBasedAlphanumericGen::with_time_source(postfix, Some(offset), clock.clone())
                .unwrap();
        (clock, generator)
    }

    fn assert_sorted(ids: &[String]) {
        let mut sorted = ids.to_vec();
        sorted.sort();
        for (i, (a, b)) in ids.iter().zip(&sorted).enumerate() {
            assert_eq!(a, b, "index {i}");
        }
    }

    #[test]
    fn test_identifier_size_is_constant() {
        for postfix in [0, 1, 10, MAX_TIME_DIGITS] {
            let generator = TimeBasedAlphanumericGen::new(postfix).unwrap();
            assert_eq!(generator.next_id().unwrap().len(), 13 + postfix);
            assert_eq!(generator.max_length(), 13 + postfix);
            assert_eq!(generator.min_length(), 13 + postfix);
        }
    }

    #[test]
    fn test_illegal_postfix_size() {
        assert!(matches!(
            TimeBasedAlphanumericGen::new(MAX_TIME_DIGITS + 1),
            Err(IdError::InvalidArgument(_))
        ));
        assert!(matches!(
            TimeBasedAlphanumericGen::with_offset(usize::MAX, 0),
            Err(IdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_capacity_exhausted_within_one_tick() {
        let (clock, generator) = manual(0, T0 - 5);
        assert_eq!(generator.next_id().unwrap(), "0000000000005");
        assert!(matches!(
            generator.next_id(),
            Err(IdError::CapacityExhausted { postfix_digits: 0 })
        ));
        // Still exhausted, not reset, until time moves on.
        assert!(generator.next_id().is_err());
        clock.advance_millis(1);
        assert_eq!(generator.next_id().unwrap(), "0000000000006");
    }

    #[test]
    fn test_one_postfix_digit_allows_36_per_tick() {
        let (_clock, generator) = manual(1, T0);
        let ids = generator.next_n(36).unwrap();
        assert_eq!(ids[0], "00000000000000");
        assert_eq!(ids[35], "0000000000000z");
        assert!(matches!(
            generator.next_id(),
            Err(IdError::CapacityExhausted { postfix_digits: 1 })
        ));
    }

    #[test]
    fn test_real_clock_exhausts_without_postfix() {
        let generator = TimeBasedAlphanumericGen::new(0).unwrap();
        let failed = (0..1_000_000).any(|_| generator.next_id().is_err());
        assert!(failed);
    }

    #[test]
    fn test_zero_offset_starts_with_zeros() {
        let (_clock, generator) = manual(0, T0);
        assert_eq!(generator.next_id().unwrap(), "0".repeat(13));

        let now = Utc::now().timestamp_millis();
        let generator = TimeBasedAlphanumericGen::with_offset(2, now).unwrap();
        let id = generator.next_id().unwrap();
        assert!(id.starts_with("0000000000"));
        assert!(id.ends_with("00"));
    }

    #[test]
    fn test_default_offset_without_postfix_is_now() {
        let before = Utc::now().timestamp_millis();
        let generator = TimeBasedAlphanumericGen::new(0).unwrap();
        let after = Utc::now().timestamp_millis();
        assert!((before..=after).contains(&generator.offset()));
    }

    #[test]
    fn test_internal_overflow_still_increases_ids() {
        // 100 ms before the signed 64-bit difference overflows.
        let (clock, generator) = manual(3, -(i64::MAX - T0 - 100));
        let mut ids = Vec::new();
        for _ in 0..200 {
            for _ in 0..5 {
                ids.push(generator.next_id().unwrap());
            }
            clock.advance_millis(1);
        }
        assert_sorted(&ids);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
        assert!(ids[0] < encode_base36(i64::MAX as u64, 13));
        assert!(ids[999] > encode_base36(i64::MAX as u64, 13));
    }

    #[test]
    fn test_internal_overflow_on_real_clock() {
        let first = Utc::now().timestamp_millis();
        let generator =
            TimeBasedAlphanumericGen::with_offset(3, -(i64::MAX - first - 100)).unwrap();
        let mut ids = Vec::new();
        while Utc::now().timestamp_millis() - first < 200 {
            match generator.next_id() {
                Ok(id) => ids.push(id),
                Err(IdError::CapacityExhausted { .. }) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_sorted(&ids);
    }

    #[test]
    fn test_ring_wrap_keeps_order() {
        // Elapsed starts two ticks before the unsigned ring wraps to zero.
        let (clock, generator) = manual(2, T0.wrapping_add(2));
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(generator.next_id().unwrap());
            clock.advance_millis(1);
        }
        assert_sorted(&ids);
        assert_eq!(ids[1], "3w5e11264sgsf00");
        assert_eq!(ids[2], "3w5e11264sgsg00");
        assert_eq!(ids[5], "3w5e11264sgsj00");
        assert_eq!(generator.millis_from(&ids[5]).unwrap(), T0 + 5);
    }

    #[test]
    fn test_ring_wrap_then_time_advances() {
        let (clock, generator) = manual(0, T0 + 2);
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(generator.next_id().unwrap());
            clock.advance_millis(1_000);
        }
        assert_eq!(ids[0], "3w5e11264sgse");
        assert_sorted(&ids);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(generator.millis_from(id).unwrap(), T0 + 1_000 * i as i64);
        }
    }

    #[test]
    fn test_backward_clock_across_ring_zero_stalls() {
        let (clock, generator) = manual(1, T0 - 3);
        let a = generator.next_id().unwrap();
        clock.advance_millis(-10);
        let b = generator.next_id().unwrap();
        assert!(a < b);
        assert_eq!(generator.millis_from(&b).unwrap(), T0);
        clock.advance_millis(11);
        let c = generator.next_id().unwrap();
        assert_eq!(c, "00000000000040");
    }

    #[test]
    fn test_backward_clock_keeps_order() {
        let (clock, generator) = manual(2, T0 - 1_000);
        let a = generator.next_id().unwrap();
        clock.advance_millis(-500);
        let b = generator.next_id().unwrap();
        let c = generator.next_id().unwrap();
        clock.advance_millis(501);
        let d = generator.next_id().unwrap();
        assert!(a < b && b < c && c < d);
        assert_eq!(generator.millis_from(&b).unwrap(), T0);
        assert_eq!(generator.millis_from(&d).unwrap(), T0 + 1);
    }

    #[test]
    fn test_retrieve_time_without_internal_overflow() {
        let (_clock, generator) = manual(4, T0 - 1_000);
        let id = generator.next_id().unwrap();
        assert_eq!(millis_from_id(&id, T0 - 1_000).unwrap(), T0);
    }

    #[test]
    fn test_retrieve_time_with_internal_overflow() {
        let (_clock, generator) = manual(4, T0 + 1_000);
        let id = generator.next_id().unwrap();
        assert!(id.starts_with("3w5e11264s"));
        assert_eq!(millis_from_id(&id, T0 + 1_000).unwrap(), T0);

        let offset = -(i64::MAX - T0 + 50);
        let (clock, generator) = manual(4, offset);
        clock.advance_millis(100);
        let id = generator.next_id().unwrap();
        assert_eq!(generator.millis_from(&id).unwrap(), T0 + 100);
    }

    #[test]
    fn test_retrieve_time_on_real_clock() {
        let now = Utc::now().timestamp_millis();
        for offset in [now - 1_000, now + 1_000] {
            let generator = TimeBasedAlphanumericGen::with_offset(4, offset).unwrap();
            let before = Utc::now().timestamp_millis();
            let id = generator.next_id().unwrap();
            let after = Utc::now().timestamp_millis();
            let at = millis_from_id(&id, offset).unwrap();
            assert!((before..=after).contains(&at), "{before} <= {at} <= {after}");
        }
    }

    #[test]
    fn test_different_instances_produce_unique_ids() {
        let generators = [
            TimeBasedAlphanumericGen::default_params(),
            TimeBasedAlphanumericGen::default_params(),
            TimeBasedAlphanumericGen::default_params(),
        ];
        let mut ids = HashSet::new();
        let mut total = 0;
        for _ in 0..1_000 {
            for generator in &generators {
                // Spin past an exhausted millisecond.
                let id = loop {
                    if let Ok(id) = generator.next_id() {
                        break id;
                    }
                };
                ids.insert(id);
                total += 1;
            }
        }
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_shared_instance_is_collision_free() {
        let (_clock, generator) = manual(2, T0);
        let generator = Arc::new(generator);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                thread::spawn(move || generator.next_n(300).unwrap())
            })
            .collect();
        let mut postfixes = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                let parsed = parse_alphanumeric_id(&id, 2).unwrap();
                assert_eq!(parsed.elapsed, 0);
                assert!(postfixes.insert(parsed.postfix));
            }
        }
        assert_eq!(postfixes.len(), 1_200);
        assert_eq!(postfixes.iter().max(), Some(&1_199));
    }

    #[test]
    fn test_parse_and_validate() {
        let p = parse_alphanumeric_id("000000000001a00z", 3).unwrap();
        assert_eq!(p.elapsed, 46);
        assert_eq!(p.postfix, 35);
        assert_eq!(p.millis(1_000), 1_046);

        let p0 = parse_alphanumeric_id("0000000000010", 0).unwrap();
        assert_eq!(p0.elapsed, 36);
        assert_eq!(p0.postfix, 0);

        assert!(validate_alphanumeric_id("0000000000000ab", 2));
        assert!(!validate_alphanumeric_id("0000000000000ab", 3));
        assert!(!validate_alphanumeric_id("0000000000000AB", 2));
        assert!(validate_alphanumeric_id("zzzzzzzzzzzzz", 0));
        assert!(!validate_alphanumeric_id("zzzzzzzzzzzz_", 0));
        assert!(!validate_alphanumeric_id("000", 14));
        assert!(matches!(millis_from_id("abc", 0), Err(IdError::InvalidArgument(_))));
    }

    #[test]
    fn test_iterator_take() {
        let generator = TimeBasedAlphanumericGen::default_params();
        let ids: Vec<String> = generator.take(5).filter_map(Result::ok).collect();
        assert!(!ids.is_empty());
        assert_sorted(&ids);
    }
}
