//! # PTable - Immutable On-Disk Index Tables
//!
//! A `PTable` is a sorted, immutable file of fixed-size index records. Tables
//! are produced by flushing a full [`MemTable`](memtable::MemTable) or by
//! merging existing tables, and are never modified afterwards.
//!
//! ## File Layout
//!
//! | Section   | Contents                                                   |
//! |-----------|------------------------------------------------------------|
//! | RECORDS   | `stream_hash u64 | event_number i64 | log_position i64`, LE  |
//! | TRAILER   | `entry_count u64 | version u8 | checksum u64` (XXH3-64)     |
//!
//! A bloom filter of the table's stream hashes may sit next to the table in
//! `<file>.bloomfilter`.
//!
//! ## Reading
//!
//! Lookups binary-search the records, narrowed by an in-memory midpoint cache.
//! Every read borrows a file handle from the table's reader pool.
//!
//! ## Lifecycle
//!
//! ```text
//! from_memtable / merge / open
//!         |
//!         v
//!      [live] --- lease_reader ---> ReaderLease (returned on drop)
//!         |
//!   mark_for_destruction
//!         |
//!         v
//!    [retired] --- last lease returned ---> files deleted
//! ```

mod format;
mod merge;
mod pool;
mod table;
mod writer;

use memtable::MemTable;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use format::{
    Trailer, CURRENT_VERSION, PTABLE_VERSION_32BIT, PTABLE_VERSION_64BIT, RECORD_SIZE,
    TRAILER_SIZE,
};
pub use merge::{ExistsAt, HashUpgrade, MergeOracles, MergeStats, ResolveCollision};
pub use pool::{LeaseMode, ReaderLease};
pub use table::{EntryRange, Midpoint, PTable, RangeIter};

#[derive(Debug, Error)]
pub enum PTableError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index table: {0}")]
    Corrupt(String),

    #[error("all {max} readers of {} are in use", .path.display())]
    ReaderExhausted { path: PathBuf, max: usize },

    #[error("table {} has been retired", .0.display())]
    TableRetired(PathBuf),

    #[error("unsupported table version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, PTableError>;

/// Deepest midpoint cache allowed: `2^28` keys per table.
pub const MAX_CACHE_DEPTH: u32 = 28;

/// Per-table open options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    /// Midpoint cache depth; `0` disables the cache.
    pub cache_depth: u32,
    pub skip_verify: bool,
    pub use_bloom_filter: bool,
    pub initial_readers: usize,
    pub max_readers: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            cache_depth: 16,
            skip_verify: false,
            use_bloom_filter: true,
            initial_readers: 2,
            max_readers: 16,
        }
    }
}

impl TableOptions {
    pub fn cache_depth(mut self, depth: u32) -> Self {
        self.cache_depth = depth;
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    pub fn use_bloom_filter(mut self, enabled: bool) -> Self {
        self.use_bloom_filter = enabled;
        self
    }

    pub fn readers(mut self, initial: usize, max: usize) -> Self {
        self.initial_readers = initial;
        self.max_readers = max;
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.cache_depth > MAX_CACHE_DEPTH {
            return Err(PTableError::InvalidArgument(format!(
                "cache depth must be at most {}, got {}",
                MAX_CACHE_DEPTH, self.cache_depth
            )));
        }
        Ok(())
    }
}

/// Consumes a [`MemTable`] into an immutable table file.
pub trait IntoImmutable {
    fn to_immutable(self, path: &Path, version: u8, opts: &TableOptions) -> Result<PTable>;
}

impl IntoImmutable for MemTable {
    fn to_immutable(self, path: &Path, version: u8, opts: &TableOptions) -> Result<PTable> {
        PTable::from_memtable(&self, path, version, opts)
    }
}

#[cfg(test)]
mod tests;
