use std::fmt;

use serde::{Deserialize, Serialize};

use crate::BlockNum;

/// A half-open interval of blocks `[start_block, exclusive_end_block)`.
///
/// Two ranges are contiguous when the first one's exclusive end equals the
/// second one's start. Ordering is by `(start_block, exclusive_end_block)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start_block: BlockNum,
    pub exclusive_end_block: BlockNum,
}

impl BlockRange {
    pub fn new(start_block: BlockNum, exclusive_end_block: BlockNum) -> Self {
        debug_assert!(
            start_block < exclusive_end_block,
            "invalid range {start_block}-{exclusive_end_block}"
        );
        BlockRange {
            start_block,
            exclusive_end_block,
        }
    }

    /// Parses `"{start}-{end}"` as rendered by `Display`.
    pub fn parse(s: &str) -> Result<Self, anyhow::Error> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("range is not of the form start-end: {s:?}"))?;
        let start: BlockNum = start.parse()?;
        let end: BlockNum = end.parse()?;
        if start >= end {
            return Err(anyhow::anyhow!("range is empty or inverted: {s:?}"));
        }
        Ok(BlockRange::new(start, end))
    }

    pub fn size(&self) -> u64 {
        self.exclusive_end_block - self.start_block
    }

    pub fn contains(&self, block: BlockNum) -> bool {
        block >= self.start_block && block < self.exclusive_end_block
    }

    /// True when `other` begins exactly where `self` ends.
    pub fn is_next_to(&self, other: &BlockRange) -> bool {
        self.exclusive_end_block == other.start_block
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start_block < other.exclusive_end_block && other.start_block < self.exclusive_end_block
    }

    /// Splits the range at every multiple of `interval`, yielding the minimal
    /// covering sequence of sub-ranges. The first and last sub-ranges may be
    /// shorter than `interval` when the endpoints are not aligned.
    pub fn split(&self, interval: u64) -> Vec<BlockRange> {
        assert!(interval > 0, "split interval must be non-zero");
        let mut out = Vec::new();
        let mut start = self.start_block;
        while start < self.exclusive_end_block {
            let boundary = start - start % interval + interval;
            let end = boundary.min(self.exclusive_end_block);
            out.push(BlockRange::new(start, end));
            start = end;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_block, self.exclusive_end_block)
    }
}

/// An ordered collection of non-overlapping ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ranges {
    ranges: Vec<BlockRange>,
}

impl Ranges {
    /// Builds a collection from ranges that must already be sorted and
    /// non-overlapping.
    pub fn new(ranges: Vec<BlockRange>) -> Result<Self, anyhow::Error> {
        let sorted = ranges
            .windows(2)
            .all(|w| w[0].exclusive_end_block <= w[1].start_block);
        if !sorted {
            return Err(anyhow::anyhow!(
                "ranges are not sorted or overlap: {ranges:?}"
            ));
        }
        Ok(Ranges { ranges })
    }

    /// Parses a comma-separated list of `start-end` ranges. An empty string
    /// yields an empty collection.
    pub fn parse(s: &str) -> Result<Self, anyhow::Error> {
        let ranges = s
            .split(',')
            .filter(|el| !el.is_empty())
            .map(BlockRange::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ranges::new(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn as_slice(&self) -> &[BlockRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRange> {
        self.ranges.iter()
    }

    pub fn first(&self) -> Option<&BlockRange> {
        self.ranges.first()
    }

    pub fn last(&self) -> Option<&BlockRange> {
        self.ranges.last()
    }

    pub fn contains(&self, block: BlockNum) -> bool {
        self.ranges.iter().any(|r| r.contains(block))
    }

    pub fn covers(&self, range: &BlockRange) -> bool {
        self.merged()
            .ranges
            .iter()
            .any(|r| r.start_block <= range.start_block && range.exclusive_end_block <= r.exclusive_end_block)
    }

    /// Inserts a range, keeping the collection sorted. Exact duplicates are
    /// dropped; overlapping inserts are rejected.
    pub fn insert(&mut self, range: BlockRange) -> Result<(), anyhow::Error> {
        match self.ranges.binary_search(&range) {
            Ok(_) => Ok(()), // already present
            Err(idx) => {
                let clash = (idx > 0 && self.ranges[idx - 1].overlaps(&range))
                    || (idx < self.ranges.len() && self.ranges[idx].overlaps(&range));
                if clash {
                    return Err(anyhow::anyhow!(
                        "range {range} overlaps an existing range in {self}"
                    ));
                }
                self.ranges.insert(idx, range);
                Ok(())
            }
        }
    }

    /// Removes and returns the lowest range.
    pub fn pop_first(&mut self) -> Option<BlockRange> {
        if self.ranges.is_empty() {
            None
        } else {
            Some(self.ranges.remove(0))
        }
    }

    /// Returns the collection with contiguous neighbours coalesced.
    pub fn merged(&self) -> Ranges {
        let mut out: Vec<BlockRange> = Vec::new();
        for range in &self.ranges {
            match out.last_mut() {
                Some(prev) if prev.is_next_to(range) => {
                    prev.exclusive_end_block = range.exclusive_end_block;
                }
                _ => out.push(*range),
            }
        }
        Ranges { ranges: out }
    }

    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(BlockRange::size).sum()
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self
            .ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", ranges)
    }
}

impl IntoIterator for Ranges {
    type Item = BlockRange;
    type IntoIter = std::vec::IntoIter<BlockRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.into_iter()
    }
}

impl FromIterator<BlockRange> for Ranges {
    /// Collects and sorts; panics on overlap, which is a programmer error in
    /// every call site (probe output and split output are disjoint).
    fn from_iter<T: IntoIterator<Item = BlockRange>>(iter: T) -> Self {
        let mut ranges: Vec<BlockRange> = iter.into_iter().collect();
        ranges.sort();
        Ranges::new(ranges).unwrap()
    }
}
