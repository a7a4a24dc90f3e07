//! Step-scoped scratch arena.
//!
//! All per-step index buffers (island membership, split item lists) are carved
//! out of one fixed-capacity block of `u32` words. Buffers are identified by
//! an [`IndexRange`] instead of a pointer and must be released in reverse
//! allocation order.

use tracing::warn;

use crate::{Result, SimError};

/// Half-open range `[begin, end)` of indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexRange {
    /// First index.
    pub begin: u32,
    /// One past the last index.
    pub end: u32,
}

impl IndexRange {
    /// An empty range.
    pub const EMPTY: Self = Self { begin: 0, end: 0 };

    /// Create a range.
    #[must_use]
    pub const fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    /// Number of indices in the range.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end - self.begin
    }

    /// True when the range has no indices.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// `begin..end` as a `usize` range.
    #[must_use]
    pub const fn as_usize(&self) -> std::ops::Range<usize> {
        self.begin as usize..self.end as usize
    }

    /// Sub-range relative to this range's start.
    #[must_use]
    pub const fn sub(&self, begin: u32, end: u32) -> Self {
        Self {
            begin: self.begin + begin,
            end: self.begin + end,
        }
    }
}

/// Fixed-capacity LIFO arena of `u32` words.
///
/// # Example
///
/// ```
/// use sim_types::StepArena;
///
/// let mut arena = StepArena::new(16);
/// let a = arena.alloc(4).unwrap();
/// let b = arena.alloc(8).unwrap();
/// arena.slice_mut(b).fill(7);
/// assert_eq!(arena.slice(b), &[7; 8]);
/// assert!(arena.alloc(8).is_err());
///
/// arena.free(b);
/// arena.free(a);
/// assert_eq!(arena.used(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct StepArena {
    words: Vec<u32>,
    top: u32,
    high_water: u32,
}

impl StepArena {
    /// Create an arena of `capacity` words.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity],
            top: 0,
            high_water: 0,
        }
    }

    /// Total capacity in words.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Words currently allocated.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top as usize
    }

    /// Largest number of words allocated at once since creation.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water as usize
    }

    /// Allocate `len` zeroed words.
    pub fn alloc(&mut self, len: usize) -> Result<IndexRange> {
        let available = self.words.len() - self.top as usize;
        if len > available {
            warn!(requested = len, available, capacity = self.words.len(), "step arena exhausted");
            return Err(SimError::capacity_exceeded("step arena", len, available));
        }
        let begin = self.top;
        let len32 = u32::try_from(len)
            .map_err(|_| SimError::capacity_exceeded("step arena", len, available))?;
        let end = begin + len32;
        self.words[begin as usize..end as usize].fill(0);
        self.top = end;
        self.high_water = self.high_water.max(end);
        Ok(IndexRange::new(begin, end))
    }

    /// Release the most recent allocation.
    pub fn free(&mut self, range: IndexRange) {
        debug_assert_eq!(range.end, self.top, "step arena freed out of order");
        self.top = range.begin.min(self.top);
    }

    /// Release everything.
    pub fn reset(&mut self) {
        self.top = 0;
    }

    /// Read an allocation.
    #[must_use]
    pub fn slice(&self, range: IndexRange) -> &[u32] {
        &self.words[range.as_usize()]
    }

    /// Write an allocation.
    pub fn slice_mut(&mut self, range: IndexRange) -> &mut [u32] {
        &mut self.words[range.as_usize()]
    }

    /// Mutable access to two disjoint allocations at once.
    pub fn slice_pair_mut(&mut self, a: IndexRange, b: IndexRange) -> (&mut [u32], &mut [u32]) {
        debug_assert!(a.end <= b.begin || b.end <= a.begin, "overlapping ranges");
        if a.end <= b.begin {
            let (lo, hi) = self.words.split_at_mut(b.begin as usize);
            (&mut lo[a.as_usize()], &mut hi[..b.len() as usize])
        } else {
            let (lo, hi) = self.words.split_at_mut(a.begin as usize);
            (&mut hi[..a.len() as usize], &mut lo[b.as_usize()])
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_index_range() {
        let r = IndexRange::new(4, 10);
        assert_eq!(r.len(), 6);
        assert!(!r.is_empty());
        assert_eq!(r.sub(1, 3), IndexRange::new(5, 7));
        assert!(IndexRange::EMPTY.is_empty());
    }

    #[test]
    fn test_alloc_is_zeroed_after_reuse() {
        let mut arena = StepArena::new(8);
        let a = arena.alloc(8).unwrap();
        arena.slice_mut(a).fill(9);
        arena.free(a);

        let b = arena.alloc(4).unwrap();
        assert_eq!(arena.slice(b), &[0; 4]);
        assert_eq!(arena.high_water(), 8);
    }

    #[test]
    fn test_capacity_error() {
        let mut arena = StepArena::new(4);
        let err = arena.alloc(5).unwrap_err();
        assert!(err.is_capacity_error());
    }

    #[test]
    fn test_slice_pair_mut() {
        let mut arena = StepArena::new(8);
        let a = arena.alloc(3).unwrap();
        let b = arena.alloc(5).unwrap();
        let (sa, sb) = arena.slice_pair_mut(b, a);
        sa.fill(2);
        sb.fill(1);
        assert_eq!(arena.slice(a), &[1; 3]);
        assert_eq!(arena.slice(b), &[2; 5]);
    }

    #[test]
    fn test_slice_pair_mut_empty_first() {
        let mut arena = StepArena::new(4);
        let empty = arena.alloc(0).unwrap();
        let b = arena.alloc(4).unwrap();
        let (se, sb) = arena.slice_pair_mut(empty, b);
        assert!(se.is_empty());
        sb.fill(3);
        assert_eq!(arena.slice(b), &[3; 4]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "out of order")]
    fn test_free_out_of_order_panics_in_debug() {
        let mut arena = StepArena::new(8);
        let a = arena.alloc(2).unwrap();
        let _b = arena.alloc(2).unwrap();
        arena.free(a);
    }

    proptest! {
        #[test]
        fn prop_lifo_allocations_are_disjoint(lens in prop::collection::vec(0_usize..32, 1..16)) {
            let mut arena = StepArena::new(256);
            let mut ranges = Vec::new();
            for &len in &lens {
                match arena.alloc(len) {
                    Ok(range) => ranges.push(range),
                    Err(e) => prop_assert!(e.is_capacity_error()),
                }
            }
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].begin);
            }
            prop_assert_eq!(arena.used(), ranges.last().map_or(0, |r| r.end as usize));

            while let Some(range) = ranges.pop() {
                arena.free(range);
            }
            prop_assert_eq!(arena.used(), 0);
        }
    }
}
