//! # MemTable - In-Memory Index Buffer
//!
//! Every event appended to the transaction log produces one [`IndexEntry`]:
//! the stream it belongs to (as a hash), its event number within the stream,
//! and the position of the record in the log.
//!
//! Entries accumulate in a [`MemTable`] until it reaches its capacity, at which
//! point the owner converts it into an immutable on-disk table.
//!
//! ## Ordering
//!
//! Entries are kept sorted by `(stream_hash, event_number)`. Adding an entry
//! whose key already exists replaces the stored position: the newest write wins.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// One index record mapping a stream event to its log position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: i64,
    pub log_position: i64,
}

impl IndexEntry {
    pub fn new(stream_hash: u64, event_number: i64, log_position: i64) -> Self {
        Self {
            stream_hash,
            event_number,
            log_position,
        }
    }

    /// The sort key of this entry.
    #[must_use]
    pub fn key(&self) -> (u64, i64) {
        (self.stream_hash, self.event_number)
    }
}

/// Bounded, sorted, in-memory buffer of index entries.
#[derive(Debug)]
pub struct MemTable {
    map: BTreeMap<(u64, i64), i64>,
    max_entries: usize,
}

impl MemTable {
    /// Creates an empty table that reports full once it holds `max_entries` keys.
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            max_entries,
        }
    }

    /// Adds an entry. A later add for the same key replaces the earlier position.
    pub fn add(&mut self, entry: IndexEntry) {
        self.map.insert(entry.key(), entry.log_position);
    }

    pub fn add_all<I: IntoIterator<Item = IndexEntry>>(&mut self, entries: I) {
        for e in entries {
            self.add(e);
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.map.len() >= self.max_entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Position of a single event, if buffered.
    #[must_use]
    pub fn get(&self, stream_hash: u64, event_number: i64) -> Option<i64> {
        self.map.get(&(stream_hash, event_number)).copied()
    }

    /// Highest-numbered buffered event of a stream.
    #[must_use]
    pub fn latest(&self, stream_hash: u64) -> Option<IndexEntry> {
        self.map
            .range((stream_hash, i64::MIN)..=(stream_hash, i64::MAX))
            .next_back()
            .map(|(&(h, n), &p)| IndexEntry::new(h, n, p))
    }

    /// Buffered events of `stream_hash` numbered within `numbers`, ascending.
    pub fn range(
        &self,
        stream_hash: u64,
        numbers: RangeInclusive<i64>,
    ) -> impl DoubleEndedIterator<Item = IndexEntry> + '_ {
        let (from, to) = numbers.into_inner();
        // BTreeMap::range panics on an inverted range.
        let bounds = (from <= to).then(|| (stream_hash, from)..=(stream_hash, to));
        bounds
            .into_iter()
            .flat_map(move |r| self.map.range(r))
            .map(|(&(h, n), &p)| IndexEntry::new(h, n, p))
    }

    /// All entries in ascending key order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = IndexEntry> + ExactSizeIterator + '_ {
        self.map
            .iter()
            .map(|(&(h, n), &p)| IndexEntry::new(h, n, p))
    }

    /// Largest log position held by this table, used as a prepare checkpoint.
    #[must_use]
    pub fn max_log_position(&self) -> Option<i64> {
        self.map.values().copied().max()
    }
}
