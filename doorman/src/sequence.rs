//! Derivation of a knock sequence from a one-time code.
//!
//! The hex SHA-1 of `pin || code` supplies everything: the first `count` hex
//! digits are the payload lengths (0-15), and `count` 4-digit groups after them
//! are the ports. Ports keep only 14 bits and are offset into the high range so
//! knocks never land on well-known services (or DNS, which the capture filter
//! excludes).

use sha1::{Digest, Sha1};

use crate::error::KnockCountError;

/// First port a knock can target.
pub const PORT_START: u16 = 32768;
/// Last port a knock can target.
pub const PORT_END: u16 = PORT_START + 0x3fff;

pub const MIN_KNOCKS: usize = 1;
pub const MAX_KNOCKS: usize = 8;
pub const DEFAULT_KNOCKS: usize = 3;

/// Checks a configured knock count against `[MIN_KNOCKS, MAX_KNOCKS]`.
///
/// Callers fall back to [`DEFAULT_KNOCKS`] on error and report it however they
/// report problems.
pub fn clamp_count(count: i64) -> Result<usize, KnockCountError> {
    if (MIN_KNOCKS as i64..=MAX_KNOCKS as i64).contains(&count) {
        Ok(count as usize)
    } else {
        Err(KnockCountError(count))
    }
}

/// Derives `(ports, lengths)` for one code. `count` must already be in
/// `[MIN_KNOCKS, MAX_KNOCKS]`; see [`clamp_count`].
pub fn derive(code: &str, pin: &str, count: usize) -> (Vec<u16>, Vec<u8>) {
    debug_assert!((MIN_KNOCKS..=MAX_KNOCKS).contains(&count));

    let mut hasher = Sha1::new();
    hasher.update(pin.as_bytes());
    hasher.update(code.as_bytes());
    let digest = hasher.finalize();

    // 40 nibbles; 8 lengths + 8 ports of 4 nibbles each fit exactly.
    let nibbles: Vec<u8> = digest.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect();

    let lengths = nibbles[..count].to_vec();
    let ports = (0..count)
        .map(|i| {
            let off = count + 4 * i;
            let word = nibbles[off..off + 4]
                .iter()
                .fold(0u16, |acc, n| (acc << 4) | u16::from(*n));
            (word & 0x3fff) + PORT_START
        })
        .collect();

    (ports, lengths)
}
