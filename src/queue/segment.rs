use std::collections::BTreeMap;
use std::fmt;

/// A contiguous byte range of a file, fetched from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Segment {
    start: u64,
    size: u64,
    overlapped: bool,
}

impl Segment {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            overlapped: false,
        }
    }

    /// A segment deliberately duplicating part of a slow running one.
    pub fn overlapping(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            overlapped: true,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_overlapped(&self) -> bool {
        self.overlapped
    }

    pub fn overlaps(&self, other: &Segment) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn contains(&self, other: &Segment) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Disjoint, merged set of completed byte ranges.
///
/// Adjacent and overlapping ranges are coalesced on insert, so iteration
/// yields ranges in ascending order with gaps between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSet {
    ranges: BTreeMap<u64, u64>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a range, clamped to `[0, limit)`.
    pub fn add(&mut self, segment: Segment, limit: u64) {
        let mut start = segment.start().min(limit);
        let mut end = segment.end().min(limit);
        if start >= end {
            return;
        }

        let touching: Vec<u64> = self
            .ranges
            .range(..=end)
            .filter(|(_, &e)| e >= start)
            .map(|(&s, _)| s)
            .collect();

        for s in touching {
            if let Some(e) = self.ranges.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }

        self.ranges.insert(start, end);
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// True when the whole of `[start, end)` lies in one done range.
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        self.ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &e)| e >= end)
    }

    pub fn overlaps(&self, segment: &Segment) -> bool {
        self.iter().any(|done| done.overlaps(segment))
    }

    /// True when the set is exactly `[0, size)`.
    pub fn covers(&self, size: u64) -> bool {
        self.ranges.len() == 1 && self.ranges.get(&0) == Some(&size)
    }

    pub fn iter(&self) -> impl Iterator<Item = Segment> + '_ {
        self.ranges.iter().map(|(&s, &e)| Segment::new(s, e - s))
    }
}

impl FromIterator<(u64, u64)> for SegmentSet {
    /// Builds a set from `(start, size)` pairs without clamping.
    fn from_iter<T: IntoIterator<Item = (u64, u64)>>(iter: T) -> Self {
        let mut set = SegmentSet::new();
        for (start, size) in iter {
            set.add(Segment::new(start, size), u64::MAX);
        }
        set
    }
}

pub(crate) fn round_down(value: u64, block: u64) -> u64 {
    if block == 0 {
        return value;
    }
    value - value % block
}

pub(crate) fn round_up(value: u64, block: u64) -> u64 {
    if block == 0 {
        return value;
    }
    value.div_ceil(block) * block
}
