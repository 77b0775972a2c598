use crate::{BlockNum, BlockRange};

/// The segment coordinate system shared by the probe, the plan and the
/// squasher: blocks map to segment indices, indices map back to ranges
/// aligned on the save interval.
///
/// Segment 0 covers `[initial_block, next boundary)` and may be shorter than
/// one interval; the last segment is partial when the exclusive end does not
/// fall on a boundary.
#[derive(Clone, Copy, Debug)]
pub struct Segmenter {
    interval: u64,
    initial_block: BlockNum,
    exclusive_end_block: BlockNum,
}

impl Segmenter {
    pub fn new(interval: u64, initial_block: BlockNum, exclusive_end_block: BlockNum) -> Self {
        assert!(interval > 0, "segment interval must be non-zero");
        Segmenter {
            interval,
            initial_block,
            exclusive_end_block,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn count(&self) -> usize {
        let init_segment = self.initial_block / self.interval;
        let last_segment = self.exclusive_end_block / self.interval;
        (last_segment - init_segment + 1) as usize
    }

    /// The range covered by segment `idx`, or `None` when the index is out of
    /// bounds or the trailing segment is empty (exclusive end exactly on a
    /// boundary).
    pub fn range(&self, idx: usize) -> Option<BlockRange> {
        if idx >= self.count() || self.exclusive_end_block <= self.initial_block {
            return None;
        }
        let base = self.initial_block - self.initial_block % self.interval;
        let start = if idx == 0 {
            self.initial_block
        } else {
            base + idx as u64 * self.interval
        };
        let end = (base + (idx as u64 + 1) * self.interval).min(self.exclusive_end_block);
        if start >= end {
            return None;
        }
        Some(BlockRange::new(start, end))
    }

    /// The index of the segment containing `block`, or `None` for blocks
    /// before the first segment. Blocks past the exclusive end still map to
    /// an index; `range` is the bounds-checked accessor.
    pub fn index_for_block(&self, block: BlockNum) -> Option<usize> {
        let init_segment = self.initial_block / self.interval;
        (block / self.interval).checked_sub(init_segment).map(|i| i as usize)
    }

    /// Whether segment `idx` ends off-boundary. Panics when `idx` is out of
    /// range, like an out-of-bounds index would.
    pub fn is_partial(&self, idx: usize) -> bool {
        let range = self
            .range(idx)
            .unwrap_or_else(|| panic!("segment index {idx} out of range"));
        range.exclusive_end_block % self.interval != 0
    }
}
