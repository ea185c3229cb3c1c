use super::segment::{Segment, SegmentSet};

/// Availability bitmap over the hash-tree blocks of one file.
///
/// Bits are numbered from the high bit of the first byte. Partial sources
/// advertise their blocks as `[start, end)` index pairs; [`BlockMap`] is the
/// in-memory form those pairs are expanded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    bits: Vec<u8>,
    block_count: usize,
}

impl BlockMap {
    pub fn new(block_count: usize) -> Self {
        Self {
            bits: vec![0; block_count.div_ceil(8)],
            block_count,
        }
    }

    pub fn full(block_count: usize) -> Self {
        let mut map = Self {
            bits: vec![0xFF; block_count.div_ceil(8)],
            block_count,
        };
        map.clear_spare_bits();
        map
    }

    /// Expands `[start, end)` block index pairs. Out-of-range indices are
    /// clipped; an odd trailing value is ignored.
    pub fn from_parts(parts: &[u32], block_count: usize) -> Self {
        let mut map = Self::new(block_count);
        for pair in parts.chunks_exact(2) {
            let start = pair[0] as usize;
            let end = (pair[1] as usize).min(block_count);
            for index in start..end {
                map.set(index);
            }
        }
        map
    }

    /// Blocks not covered by any done segment.
    pub fn needed(done: &SegmentSet, file_size: u64, block_size: u64) -> Self {
        let block_count = file_size.div_ceil(block_size.max(1)) as usize;
        let mut map = Self::full(block_count);
        for index in 0..block_count {
            let start = index as u64 * block_size;
            let end = (start + block_size).min(file_size);
            if done.contains_range(start, end) {
                map.clear(index);
            }
        }
        map
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.block_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.block_count {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        if index >= self.block_count {
            return;
        }
        self.bits[index / 8] &= !(1 << (7 - index % 8));
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.block_count
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn intersection(&self, other: &BlockMap) -> BlockMap {
        let block_count = self.block_count.min(other.block_count);
        let mut map = Self::new(block_count);
        for (i, byte) in map.bits.iter_mut().enumerate() {
            *byte = self.bits.get(i).copied().unwrap_or(0) & other.bits.get(i).copied().unwrap_or(0);
        }
        map.clear_spare_bits();
        map
    }

    /// Contiguous runs of set blocks as `[start, end)` index pairs.
    pub fn runs(&self) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut current: Option<usize> = None;
        for index in 0..self.block_count {
            match (self.has(index), current) {
                (true, None) => current = Some(index),
                (false, Some(start)) => {
                    runs.push((start, index));
                    current = None;
                }
                _ => {}
            }
        }
        if let Some(start) = current {
            runs.push((start, self.block_count));
        }
        runs
    }

    /// Flattened run list, the form partial sources put on the wire.
    pub fn to_parts(&self) -> Vec<u32> {
        self.runs()
            .into_iter()
            .flat_map(|(s, e)| [s as u32, e as u32])
            .collect()
    }

    /// Byte ranges of the set runs.
    pub fn segments(&self, file_size: u64, block_size: u64) -> Vec<Segment> {
        self.runs()
            .into_iter()
            .map(|(s, e)| {
                let start = (s as u64 * block_size).min(file_size);
                let end = (e as u64 * block_size).min(file_size);
                Segment::new(start, end - start)
            })
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.block_count;
        if spare > 0 && spare < 8 && !self.bits.is_empty() {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 << spare;
        }
    }
}
