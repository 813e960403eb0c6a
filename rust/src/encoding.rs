//! Fixed-width base-36 and MAC-address text encodings.
//!
//! Base-36 values are treated as positions on the unsigned 64-bit ring, so
//! two encodings of the same width sort lexically exactly as their numeric
//! values do.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::IdError;

/// Digits used for base-36 output, in ascending order.
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Number of base-36 digits needed for any `u64` (and for `i64::MAX`).
pub const MAX_TIME_DIGITS: usize = 13;

/// Byte length of a node identifier.
pub const NODE_ID_LEN: usize = 6;

static MAC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5}$|^[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}$")
        .unwrap()
});

/// Encode `value` as exactly `width` lowercase base-36 digits.
///
/// Digits above `width` are dropped, i.e. the value is reduced modulo
/// `36^width`. Callers size `width` so that never happens.
pub fn encode_base36(value: u64, width: usize) -> String {
    encode_base36_wide(u128::from(value), width)
}

/// [`encode_base36`] for positions past the end of the 64-bit ring.
/// Thirteen digits hold a little over nine laps of it.
pub fn encode_base36_wide(value: u128, width: usize) -> String {
    let mut buf = vec![b'0'; width];
    let mut v = value;
    for slot in buf.iter_mut().rev() {
        if v == 0 {
            break;
        }
        *slot = BASE36_DIGITS[(v % 36) as usize];
        v /= 36;
    }
    // Only ASCII digits were written.
    String::from_utf8(buf).unwrap_or_default()
}

/// Decode a base-36 string into an unsigned ring position.
pub fn decode_base36(s: &str) -> Result<u64, IdError> {
    u64::try_from(decode_base36_wide(s)?)
        .map_err(|_| IdError::InvalidArgument(format!("base-36 value out of range: {s}")))
}

/// Decode a base-36 string of at most 24 digits.
pub fn decode_base36_wide(s: &str) -> Result<u128, IdError> {
    if s.is_empty() {
        return Err(IdError::InvalidArgument("empty base-36 value".to_string()));
    }
    s.chars().try_fold(0u128, |acc, c| {
        let digit = c
            .to_digit(36)
            .ok_or_else(|| IdError::InvalidArgument(format!("invalid base-36 digit {c:?}")))?;
        acc.checked_mul(36)
            .and_then(|v| v.checked_add(u128::from(digit)))
            .ok_or_else(|| IdError::InvalidArgument(format!("base-36 value out of range: {s}")))
    })
}

/// Number of base-36 digits needed to write `value`.
pub fn base36_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value / 36;
    while v > 0 {
        len += 1;
        v /= 36;
    }
    len
}

/// Largest value representable by `digits` base-36 digits, saturating at `u64::MAX`.
pub fn base36_capacity(digits: usize) -> u64 {
    let mut cap: u64 = 1;
    for _ in 0..digits {
        cap = match cap.checked_mul(36) {
            Some(c) => c,
            None => return u64::MAX,
        };
    }
    cap - 1
}

/// Encode node bytes as `XX-XX-XX-XX-XX-XX`, uppercase.
pub fn encode_mac_address(address: &[u8; NODE_ID_LEN]) -> String {
    address
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join("-")
}

/// Decode `XX-XX-XX-XX-XX-XX` (or the colon-separated form) into node bytes.
pub fn decode_mac_address(address: &str) -> Result<[u8; NODE_ID_LEN], IdError> {
    let trimmed = address.trim();
    if !MAC_PATTERN.is_match(trimmed) {
        return Err(IdError::InvalidNode(address.to_string()));
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let mut out = [0u8; NODE_ID_LEN];
    hex::decode_to_slice(digits, &mut out)
        .map_err(|_| IdError::InvalidNode(address.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_time_digits_covers_both_ring_halves() {
        assert_eq!(base36_len(i64::MAX as u64), MAX_TIME_DIGITS);
        assert_eq!(base36_len(u64::MAX), MAX_TIME_DIGITS);
        assert_eq!(encode_base36(i64::MAX as u64, MAX_TIME_DIGITS), "1y2p0ij32e8e7");
        assert_eq!(encode_base36(u64::MAX, MAX_TIME_DIGITS), "3w5e11264sgsf");
    }

    #[test]
    fn test_encode_fixed_width() {
        assert_eq!(encode_base36(0, 4), "0000");
        assert_eq!(encode_base36(35, 2), "0z");
        assert_eq!(encode_base36(36, 2), "10");
        assert_eq!(encode_base36(0, 0), "");
    }

    #[test]
    fn test_lexical_order_follows_ring_position() {
        let around_sign_flip = [
            i64::MAX as u64 - 1,
            i64::MAX as u64,
            i64::MAX as u64 + 1,
            u64::MAX - 1,
        ];
        let encoded: Vec<String> = around_sign_flip
            .iter()
            .map(|v| encode_base36(*v, MAX_TIME_DIGITS))
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_decode_base36() {
        assert_eq!(decode_base36("0000").unwrap(), 0);
        assert_eq!(decode_base36("zz").unwrap(), 36 * 36 - 1);
        assert_eq!(decode_base36("3w5e11264sgsf").unwrap(), u64::MAX);
        assert!(matches!(decode_base36(""), Err(IdError::InvalidArgument(_))));
        assert!(matches!(decode_base36("ab-c"), Err(IdError::InvalidArgument(_))));
        assert!(matches!(
            decode_base36("3w5e11264sgsg"),
            Err(IdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_wide_values_continue_past_the_ring() {
        let lap = u128::from(u64::MAX) + 1;
        assert_eq!(encode_base36_wide(lap, MAX_TIME_DIGITS), "3w5e11264sgsg");
        assert_eq!(decode_base36_wide("3w5e11264sgsg").unwrap(), lap);
        assert_eq!(
            decode_base36_wide("zzzzzzzzzzzzz").unwrap(),
            36u128.pow(13) - 1
        );
        let last_of_first_lap = encode_base36(u64::MAX, MAX_TIME_DIGITS);
        assert!(last_of_first_lap < encode_base36_wide(lap, MAX_TIME_DIGITS));
    }

    #[test]
    fn test_capacity() {
        assert_eq!(base36_capacity(0), 0);
        assert_eq!(base36_capacity(1), 35);
        assert_eq!(base36_capacity(3), 36 * 36 * 36 - 1);
        assert_eq!(base36_capacity(20), u64::MAX);
    }

    #[test]
    fn test_mac_round_trip_is_uppercase() {
        let bytes = [0x1a, 0x2b, 0x3c, 0x4d, 0x5e, 0x6f];
        let text = encode_mac_address(&bytes);
        assert_eq!(text, "1A-2B-3C-4D-5E-6F");
        assert_eq!(decode_mac_address(&text).unwrap(), bytes);
        assert_eq!(decode_mac_address("1a:2b:3c:4d:5e:6f").unwrap(), bytes);
    }

    #[test]
    fn test_mac_decode_rejects_malformed() {
        for bad in [
            "AA-BB-CC",
            "",
            "AA-BB-CC-DD-EE-FF-00",
            "AA-BB-CC-DD-EE-GG",
            "AABBCCDDEEFF",
            "AA-BB:CC-DD-EE-FF",
            "A-BB-CC-DD-EE-FFF",
        ] {
            assert!(
                matches!(decode_mac_address(bad), Err(IdError::InvalidNode(_))),
                "{bad} should be rejected"
            );
        }
    }
}
