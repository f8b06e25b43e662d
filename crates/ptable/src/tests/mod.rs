mod pool_tests;
mod reader_tests;

use crate::*;
use anyhow::Result;
use memtable::{IndexEntry, MemTable};
use std::path::Path;

/// Helper: build a table at `dir/name` from `(hash, number, position)` triples.
pub(crate) fn write_table(
    dir: &Path,
    name: &str,
    entries: &[(u64, i64, i64)],
    version: u8,
    opts: &TableOptions,
) -> Result<PTable> {
    let mut mem = MemTable::new(entries.len().max(1));
    for &(h, n, p) in entries {
        mem.add(IndexEntry::new(h, n, p));
    }
    Ok(mem.to_immutable(&dir.join(name), version, opts)?)
}

pub(crate) fn keys(entries: &[IndexEntry]) -> Vec<(u64, i64)> {
    entries.iter().map(|e| e.key()).collect()
}

/// Oracles that keep everything and upgrade with a fixed low half.
pub(crate) fn keep_all<R>(f: impl FnOnce(MergeOracles<'_>) -> R) -> R {
    let exists = |_: &IndexEntry| true;
    let resolve = |e: &IndexEntry| (format!("stream-{}", e.stream_hash), true);
    let upgrade = |_: &str, old: u64| old << 32 | 0xABCD;
    f(MergeOracles {
        exists_at: &exists,
        resolve_collision: &resolve,
        hash_upgrade: &upgrade,
    })
}
