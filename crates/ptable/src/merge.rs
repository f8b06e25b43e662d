//! K-way merge of tables into a new table.
//!
//! Inputs are given oldest first. The merge walks them with a min-heap keyed
//! by `(stream_hash, event_number)`; when several inputs hold the same key
//! only the entry from the newest input is kept. Each surviving entry is then
//! checked against the transaction log through the [`ExistsAt`] and
//! [`ResolveCollision`] oracles.
//!
//! Inputs written with an older format version are upgraded on the way in:
//! their entries are filtered, rehashed with [`HashUpgrade`], re-sorted in
//! memory, and only then join the heap.

use memtable::IndexEntry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use std::time::Instant;

use crate::table::{PTable, RangeIter};
use crate::writer::TableWriter;
use crate::{PTableError, Result, TableOptions};

/// Does the log still hold the record this entry points at?
pub trait ExistsAt {
    fn exists_at(&self, entry: &IndexEntry) -> bool;
}

/// Reads the stream name of the record an entry points at and reports
/// whether that stream still owns the entry's hash.
pub trait ResolveCollision {
    fn resolve_collision(&self, entry: &IndexEntry) -> (String, bool);
}

/// Computes the current-version hash of a stream from its older hash.
pub trait HashUpgrade {
    fn upgrade_hash(&self, stream_name: &str, old_hash: u64) -> u64;
}

impl<F: Fn(&IndexEntry) -> bool> ExistsAt for F {
    fn exists_at(&self, entry: &IndexEntry) -> bool {
        self(entry)
    }
}

impl<F: Fn(&IndexEntry) -> (String, bool)> ResolveCollision for F {
    fn resolve_collision(&self, entry: &IndexEntry) -> (String, bool) {
        self(entry)
    }
}

impl<F: Fn(&str, u64) -> u64> HashUpgrade for F {
    fn upgrade_hash(&self, stream_name: &str, old_hash: u64) -> u64 {
        self(stream_name, old_hash)
    }
}

/// The log-backed callbacks consulted while merging.
#[derive(Clone, Copy)]
pub struct MergeOracles<'a> {
    pub exists_at: &'a dyn ExistsAt,
    pub resolve_collision: &'a dyn ResolveCollision,
    pub hash_upgrade: &'a dyn HashUpgrade,
}

impl<'a> MergeOracles<'a> {
    /// Returns the stream name when the entry should be kept.
    fn admit(&self, entry: &IndexEntry) -> Option<String> {
        if !self.exists_at.exists_at(entry) {
            return None;
        }
        let (name, owns) = self.resolve_collision.resolve_collision(entry);
        owns.then_some(name)
    }
}

/// Summary of a finished merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeStats {
    pub entries_in: u64,
    pub entries_out: u64,
}

/// A pending entry from one merge source.
struct HeapEntry {
    entry: IndexEntry,
    /// Input index; higher is newer.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key() && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse the key so the smallest pops
        // first, and on a tie pop the newest source first.
        other
            .entry
            .key()
            .cmp(&self.entry.key())
            .then_with(|| self.source.cmp(&other.source))
    }
}

enum Source<'a> {
    /// Same-version input, read straight from disk; oracles run in the merge loop.
    Disk(RangeIter<'a>),
    /// Upgraded input, already filtered and re-sorted.
    Upgraded(std::vec::IntoIter<IndexEntry>),
}

impl Source<'_> {
    fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        match self {
            Source::Disk(iter) => iter.next().transpose(),
            Source::Upgraded(iter) => Ok(iter.next()),
        }
    }

    fn prefiltered(&self) -> bool {
        matches!(self, Source::Upgraded(_))
    }
}

impl PTable {
    /// Merges `tables` (oldest first) into a new table at `path` written with
    /// `version`.
    ///
    /// Fails with [`PTableError::UnsupportedVersion`] if any input is newer
    /// than `version`; inputs never get downgraded.
    pub fn merge(
        tables: &[&PTable],
        path: &Path,
        version: u8,
        oracles: MergeOracles<'_>,
        opts: &TableOptions,
    ) -> Result<(PTable, MergeStats)> {
        crate::format::check_version(version)?;
        opts.check()?;
        if let Some(t) = tables.iter().find(|t| t.version() > version) {
            return Err(PTableError::InvalidArgument(format!(
                "cannot merge version {} table {} into version {}",
                t.version(),
                t.path().display(),
                version
            )));
        }

        let started = Instant::now();
        let entries_in: u64 = tables.iter().map(|t| t.count()).sum();
        tracing::info!(
            inputs = tables.len(),
            entries = entries_in,
            version,
            output = %path.display(),
            "merging tables"
        );

        let mut sources = Vec::with_capacity(tables.len());
        for table in tables {
            if table.version() < version {
                sources.push(Source::Upgraded(upgraded_entries(table, oracles)?));
            } else {
                sources.push(Source::Disk(table.iter_all()?));
            }
        }

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, src) in sources.iter_mut().enumerate() {
            if let Some(entry) = src.next_entry()? {
                heap.push(HeapEntry { entry, source });
            }
        }

        let mut writer = TableWriter::create(path, version, entries_in, opts.use_bloom_filter)?;
        let mut entries_out = 0u64;

        while let Some(top) = heap.pop() {
            advance(&mut sources, &mut heap, top.source)?;

            // Older duplicates of the same key are shadowed.
            while heap
                .peek()
                .map_or(false, |next| next.entry.key() == top.entry.key())
            {
                if let Some(dup) = heap.pop() {
                    advance(&mut sources, &mut heap, dup.source)?;
                }
            }

            if !sources[top.source].prefiltered() && oracles.admit(&top.entry).is_none() {
                continue;
            }
            writer.append(&top.entry)?;
            entries_out += 1;
        }

        drop(sources);
        writer.finish()?;

        let stats = MergeStats {
            entries_in,
            entries_out,
        };
        tracing::info!(
            output = %path.display(),
            entries_in,
            entries_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge finished"
        );
        let merged = PTable::open(path, &opts.clone().skip_verify(true))?;
        Ok((merged, stats))
    }

    /// Rewrites this table keeping only the entries `should_keep` accepts.
    pub fn scavenged(
        &self,
        path: &Path,
        should_keep: &dyn Fn(&IndexEntry) -> bool,
        opts: &TableOptions,
    ) -> Result<(PTable, MergeStats)> {
        opts.check()?;
        let started = Instant::now();
        let mut writer =
            TableWriter::create(path, self.version(), self.count(), opts.use_bloom_filter)?;
        let mut entries_out = 0u64;
        for entry in self.iter_all()? {
            let entry = entry?;
            if should_keep(&entry) {
                writer.append(&entry)?;
                entries_out += 1;
            }
        }
        writer.finish()?;

        tracing::info!(
            source = %self.path().display(),
            output = %path.display(),
            kept = entries_out,
            removed = self.count() - entries_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scavenged table"
        );
        let table = PTable::open(path, &opts.clone().skip_verify(true))?;
        Ok((
            table,
            MergeStats {
                entries_in: self.count(),
                entries_out,
            },
        ))
    }
}

fn advance(
    sources: &mut [Source<'_>],
    heap: &mut BinaryHeap<HeapEntry>,
    source: usize,
) -> Result<()> {
    if let Some(entry) = sources[source].next_entry()? {
        heap.push(HeapEntry { entry, source });
    }
    Ok(())
}

/// Reads an older-version table, keeps the admitted entries with upgraded
/// hashes, and sorts them for the merge.
fn upgraded_entries(
    table: &PTable,
    oracles: MergeOracles<'_>,
) -> Result<std::vec::IntoIter<IndexEntry>> {
    let mut out = Vec::with_capacity(table.count() as usize);
    for entry in table.iter_all()? {
        let entry = entry?;
        if let Some(name) = oracles.admit(&entry) {
            let hash = oracles.hash_upgrade.upgrade_hash(&name, entry.stream_hash);
            out.push(IndexEntry::new(hash, entry.event_number, entry.log_position));
        }
    }
    out.sort_by_key(|e| e.key());
    // The writer requires strictly ascending keys.
    out.dedup_by_key(|e| e.key());
    tracing::debug!(
        path = %table.path().display(),
        kept = out.len(),
        total = table.count(),
        "upgraded table entries"
    );
    Ok(out.into_iter())
}
