/// Compaction policy: decides which level merges next.
///
/// Tiered, size-agnostic: every level holds tables of roughly equal size, so
/// a level that accumulates `max_tables_per_level` tables is merged into one
/// table one level deeper. Levels at or above `max_auto_merge_level` are left
/// alone by the automatic cascade and only merged on request, where all of
/// them fold into a single table.
///
/// The policy only looks at table counts per level; the leveled index does
/// the actual merging.
use crate::{IndexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    max_tables_per_level: usize,
    max_auto_merge_level: u32,
}

impl CompactionPolicy {
    /// Fails unless `max_tables_per_level` is at least 2: a level holding a
    /// single table must never count as full.
    pub fn new(max_tables_per_level: usize, max_auto_merge_level: u32) -> Result<Self> {
        if max_tables_per_level < 2 {
            return Err(IndexError::InvalidArgument(format!(
                "max tables per level must be at least 2, got {}",
                max_tables_per_level
            )));
        }
        Ok(Self {
            max_tables_per_level,
            max_auto_merge_level,
        })
    }

    #[must_use]
    pub fn max_tables_per_level(&self) -> usize {
        self.max_tables_per_level
    }

    #[must_use]
    pub fn max_auto_merge_level(&self) -> u32 {
        self.max_auto_merge_level
    }

    /// Whether `level`, now holding `tables` tables, must be merged by the
    /// automatic cascade.
    #[must_use]
    pub fn should_auto_merge(&self, level: u32, tables: usize) -> bool {
        level < self.max_auto_merge_level && tables >= 2 && tables >= self.max_tables_per_level
    }

    /// The first level at or above `max_auto_merge_level` holding at least
    /// two tables, given table counts per level. `None` when every such
    /// level has zero or one table.
    #[must_use]
    pub fn manual_merge_level(&self, level_sizes: &[usize]) -> Option<u32> {
        let first = self.max_auto_merge_level as usize;
        level_sizes
            .iter()
            .enumerate()
            .skip(first)
            .find(|&(_, &n)| n >= 2)
            .map(|(level, _)| level as u32)
    }

    /// Where a manual merge writes its output: the deepest non-empty level
    /// at or above `max_auto_merge_level`.
    #[must_use]
    pub fn manual_merge_target(&self, level_sizes: &[usize]) -> Option<u32> {
        let first = self.max_auto_merge_level as usize;
        level_sizes
            .iter()
            .rposition(|&n| n > 0)
            .filter(|&deepest| deepest >= first)
            .map(|deepest| deepest as u32)
    }
}
