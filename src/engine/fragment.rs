// Byte-range algebra: half-open intervals and the merged set of cached fragments.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Half-open byte interval `[start, end)`. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u64, u64)", into = "(u64, u64)")]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Returns `None` when `start >= end`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Range of `len` bytes starting at `start`, `None` when `len == 0` or on overflow.
    pub fn with_len(start: u64, len: u64) -> Option<Self> {
        Self::new(start, start.checked_add(len)?)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        ByteRange::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Overlapping or sharing a boundary.
    pub fn touches(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_range(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// HTTP `Range` header value; the end offset is inclusive on the wire.
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl TryFrom<(u64, u64)> for ByteRange {
    type Error = String;

    fn try_from((start, end): (u64, u64)) -> Result<Self, Self::Error> {
        ByteRange::new(start, end).ok_or_else(|| format!("empty byte range [{}, {})", start, end))
    }
}

impl From<ByteRange> for (u64, u64) {
    fn from(range: ByteRange) -> Self {
        (range.start, range.end)
    }
}

/// Sorted set of disjoint, non-touching byte ranges already present on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ByteRange>", into = "Vec<ByteRange>")]
pub struct FragmentSet {
    ranges: Vec<ByteRange>,
}

impl FragmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `range`, merging it with every fragment it overlaps or touches.
    pub fn insert(&mut self, range: ByteRange) {
        // Ends are ascending, so the first fragment reaching `range.start` opens the run.
        let first = match self.ranges.iter().position(|r| r.end >= range.start) {
            Some(index) => index,
            None => {
                self.ranges.push(range);
                return;
            }
        };

        let mut merged = range;
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start <= range.end {
            merged.start = merged.start.min(self.ranges[last].start);
            merged.end = merged.end.max(self.ranges[last].end);
            last += 1;
        }

        if last == first {
            self.ranges.insert(first, range);
        } else {
            self.ranges.splice(first..last, std::iter::once(merged));
        }
    }

    /// Stored fragments clipped to `range`, in ascending order.
    pub fn query(&self, range: &ByteRange) -> Vec<ByteRange> {
        self.ranges
            .iter()
            .take_while(|r| r.start < range.end)
            .filter_map(|r| r.intersect(range))
            .collect()
    }

    /// Whether every byte of `range` is cached.
    pub fn contains(&self, range: &ByteRange) -> bool {
        self.ranges.iter().any(|r| r.contains_range(range))
    }

    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl From<Vec<ByteRange>> for FragmentSet {
    fn from(ranges: Vec<ByteRange>) -> Self {
        let mut set = FragmentSet::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }
}

impl From<FragmentSet> for Vec<ByteRange> {
    fn from(set: FragmentSet) -> Self {
        set.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    fn set_of(ranges: &[(u64, u64)]) -> FragmentSet {
        ranges.iter().map(|&(s, e)| r(s, e)).collect::<Vec<_>>().into()
    }

    fn as_pairs(set: &FragmentSet) -> Vec<(u64, u64)> {
        set.iter().map(|x| (x.start, x.end)).collect()
    }

    #[test]
    fn test_empty_range_rejected() {
        assert!(ByteRange::new(5, 5).is_none());
        assert!(ByteRange::new(6, 5).is_none());
        assert!(ByteRange::with_len(3, 0).is_none());
        assert_eq!(ByteRange::with_len(3, 4), Some(r(3, 7)));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut once = FragmentSet::new();
        once.insert(r(10, 20));
        let mut twice = once.clone();
        twice.insert(r(10, 20));
        assert_eq!(once, twice);
        assert_eq!(as_pairs(&twice), vec![(10, 20)]);
    }

    #[test]
    fn test_touching_ranges_merge_in_any_order() {
        let mut a = FragmentSet::new();
        a.insert(r(0, 10));
        a.insert(r(10, 20));

        let mut b = FragmentSet::new();
        b.insert(r(10, 20));
        b.insert(r(0, 10));

        assert_eq!(as_pairs(&a), vec![(0, 20)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_disjoint_inserts_stay_sorted() {
        let mut set = FragmentSet::new();
        set.insert(r(50, 60));
        set.insert(r(0, 10));
        set.insert(r(20, 30));
        set.insert(r(100, 110));
        assert_eq!(as_pairs(&set), vec![(0, 10), (20, 30), (50, 60), (100, 110)]);
    }

    #[test]
    fn test_insert_spanning_gap_closes_run() {
        let mut set = set_of(&[(0, 10), (20, 30), (40, 50), (80, 90)]);
        set.insert(r(5, 45));
        assert_eq!(as_pairs(&set), vec![(0, 50), (80, 90)]);

        set.insert(r(50, 80));
        assert_eq!(as_pairs(&set), vec![(0, 90)]);
    }

    #[test]
    fn test_insert_inside_existing_is_noop() {
        let mut set = set_of(&[(0, 100)]);
        set.insert(r(10, 20));
        assert_eq!(as_pairs(&set), vec![(0, 100)]);
    }

    #[test]
    fn test_insert_extends_single_fragment() {
        let mut set = set_of(&[(10, 20), (40, 50)]);
        set.insert(r(15, 25));
        set.insert(r(35, 41));
        assert_eq!(as_pairs(&set), vec![(10, 25), (35, 50)]);
    }

    #[test]
    fn test_query_clips_to_range() {
        let set = set_of(&[(0, 10), (20, 30), (40, 50)]);
        let hits = set.query(&r(5, 45));
        assert_eq!(hits, vec![r(5, 10), r(20, 30), r(40, 45)]);
        assert!(set.query(&r(10, 20)).is_empty());
    }

    #[test]
    fn test_contains_and_covered_bytes() {
        let set = set_of(&[(0, 10), (20, 30)]);
        assert!(set.contains(&r(2, 8)));
        assert!(!set.contains(&r(5, 25)));
        assert_eq!(set.covered_bytes(), 20);
    }

    #[test]
    fn test_deserialize_normalizes_fragments() {
        let set: FragmentSet = serde_json::from_str("[[20,30],[0,10],[10,15]]").unwrap();
        assert_eq!(as_pairs(&set), vec![(0, 15), (20, 30)]);
        assert_eq!(serde_json::to_string(&set).unwrap(), "[[0,15],[20,30]]");
        assert!(serde_json::from_str::<FragmentSet>("[[5,5]]").is_err());
    }
}
