// src/core/lsn.rs

//! A WAL log sequence number: a monotonic byte offset used as the ordering
//! coordinate when comparing standby progress during an election.
//!
//! Mirrors Postgres's own `pg/XXXXXXXX` textual LSN format (a pair of
//! hex-encoded 32-bit halves) without depending on a running connection.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn from_parts(high: u32, low: u32) -> Self {
        Lsn(((high as u64) << 32) | low as u64)
    }

    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid LSN string: {0}")]
pub struct ParseLsnError(String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high_str, low_str) = s
            .split_once('/')
            .ok_or_else(|| ParseLsnError(s.to_string()))?;
        let high = u32::from_str_radix(high_str, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        let low = u32::from_str_radix(low_str, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        Ok(Lsn::from_parts(high, low))
    }
}

/// Compares two LSNs the way the election's candidate-selection step does:
/// higher wins. Kept as a free function so call sites read like plain
/// "higher last_wal_receive_lsn wins" prose.
pub fn higher(a: Lsn, b: Lsn) -> Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let lsn = Lsn::from_parts(0, 0x500);
        let text = lsn.to_string();
        assert_eq!(text, "0/500");
        assert_eq!(lsn, text.parse().unwrap());
    }

    #[test]
    fn orders_by_full_value_not_just_low_half() {
        let a = Lsn::from_parts(1, 0);
        let b = Lsn::from_parts(0, 0xFFFF_FFFF);
        assert!(a > b);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("not-an-lsn".parse::<Lsn>().is_err());
        assert!("12/".parse::<Lsn>().is_err());
    }
}
