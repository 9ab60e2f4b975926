//! Pool statistics snapshots

use std::fmt;
use std::ops::Add;

/// Byte-level footprint of a set of blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Bytes charged for consumed payload, headers and padding
    pub bytes_allocated: usize,
    /// Bytes of reserved address space
    pub bytes_reserved: usize,
    /// Committed-but-unconsumed payload bytes
    pub bytes_free: usize,
}

impl Statistics {
    /// Allocated plus free: the full committed footprint.
    pub fn bytes_allocated_total(&self) -> usize {
        self.bytes_allocated + self.bytes_free
    }
}

impl Add for Statistics {
    type Output = Statistics;

    fn add(self, rhs: Statistics) -> Statistics {
        Statistics {
            bytes_allocated: self.bytes_allocated + rhs.bytes_allocated,
            bytes_reserved: self.bytes_reserved + rhs.bytes_reserved,
            bytes_free: self.bytes_free + rhs.bytes_free,
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.bytes_allocated_total().max(1);
        write!(
            f,
            "allocated = {:7.3} MB, reserved = {:7.3} MB, free = {:7.3} MB ({:5.2}%)",
            self.bytes_allocated as f64 * 1e-6,
            self.bytes_reserved as f64 * 1e-6,
            self.bytes_free as f64 * 1e-6,
            100.0 * self.bytes_free as f64 / total as f64,
        )
    }
}

/// Full per-kind breakdown of a pool's footprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullStatistics {
    /// Bytes handed out to callers (pool counters + live thread locals)
    pub bytes_used: usize,
    /// Alignment padding and retired slab tails
    pub bytes_wasted: usize,
    /// Every block regardless of kind
    pub all: Statistics,
    /// Heap-allocated blocks
    pub aligned: Statistics,
    /// OS mappings on base pages
    pub os_small: Statistics,
    /// OS mappings on huge pages
    pub os_huge: Statistics,
    /// Caller-owned shared regions
    pub shared: Statistics,
}

impl fmt::Display for FullStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.all.bytes_allocated_total().max(1) as f64;
        writeln!(
            f,
            "  total : {}, used = {:.3} MB ({:.2}%), wasted = {:.3} MB ({:.2}%)",
            self.all,
            self.bytes_used as f64 * 1e-6,
            100.0 * self.bytes_used as f64 / total,
            self.bytes_wasted as f64 * 1e-6,
            100.0 * self.bytes_wasted as f64 / total,
        )?;
        writeln!(f, "  4K    : {}", self.os_small)?;
        writeln!(f, "  2M    : {}", self.os_huge)?;
        writeln!(f, "  malloc: {}", self.aligned)?;
        write!(f, "  shared: {}", self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_add() {
        let a = Statistics { bytes_allocated: 10, bytes_reserved: 20, bytes_free: 5 };
        let b = Statistics { bytes_allocated: 1, bytes_reserved: 2, bytes_free: 3 };
        let sum = a + b;
        assert_eq!(sum.bytes_allocated, 11);
        assert_eq!(sum.bytes_reserved, 22);
        assert_eq!(sum.bytes_free, 8);
        assert_eq!(sum.bytes_allocated_total(), 19);
    }

    #[test]
    fn display_is_stable() {
        let s = Statistics { bytes_allocated: 1_000_000, bytes_reserved: 2_000_000, bytes_free: 0 };
        let text = s.to_string();
        assert!(text.contains("allocated"));
        assert!(text.contains("1.000"));
    }
}
