// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! Timestamps handed out by the placement driver's timestamp oracle.
//!
//! A timestamp is a 64-bit value composed of a physical millisecond clock in
//! the high bits and a logical counter in the low 18 bits. Timestamps are
//! totally ordered and monotonically increasing across the cluster.

use std::fmt;

const PHYSICAL_SHIFT_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << PHYSICAL_SHIFT_BITS) - 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// A timestamp earlier than every valid timestamp.
    pub fn zero() -> TimeStamp {
        TimeStamp(0)
    }

    pub fn new(ts: u64) -> TimeStamp {
        TimeStamp(ts)
    }

    /// Composes a timestamp from a physical millisecond clock reading and a
    /// logical counter.
    pub fn compose(physical: u64, logical: u64) -> TimeStamp {
        TimeStamp((physical << PHYSICAL_SHIFT_BITS) + (logical & LOGICAL_MASK))
    }

    /// The physical (millisecond) part.
    pub fn physical(self) -> u64 {
        self.0 >> PHYSICAL_SHIFT_BITS
    }

    /// The logical counter part.
    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for TimeStamp {
    fn from(ts: u64) -> TimeStamp {
        TimeStamp(ts)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose() {
        let cases = vec![(0, 0), (1, 1), (1 << 40, 0), (1 << 40, (1 << 18) - 1)];
        for (physical, logical) in cases {
            let ts = TimeStamp::compose(physical, logical);
            assert_eq!(ts.physical(), physical);
            assert_eq!(ts.logical(), logical);
        }
    }

    #[test]
    fn test_logical_overflow_masked() {
        // A logical part beyond 18 bits must not leak into the physical part.
        let ts = TimeStamp::compose(42, LOGICAL_MASK + 3);
        assert_eq!(ts.physical(), 42);
        assert_eq!(ts.logical(), 3);
    }

    #[test]
    fn test_ordering() {
        assert!(TimeStamp::compose(100, 5) < TimeStamp::compose(101, 0));
        assert!(TimeStamp::compose(100, 5) < TimeStamp::compose(100, 6));
        assert!(TimeStamp::zero().is_zero());
    }
}
