mod manifest_tests;

use crate::*;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// In-memory transaction log: position -> stream name.
#[derive(Default)]
pub(crate) struct FakeLog {
    records: Mutex<HashMap<i64, String>>,
}

impl FakeLog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn write(&self, position: i64, stream: &str) {
        self.records.lock().insert(position, stream.to_string());
    }

    pub(crate) fn truncate_before(&self, position: i64) {
        self.records.lock().retain(|&p, _| p >= position);
    }
}

impl LogReader for FakeLog {
    fn exists_at(&self, position: i64) -> bool {
        self.records.lock().contains_key(&position)
    }

    fn read_stream(&self, position: i64) -> Option<String> {
        self.records.lock().get(&position).cloned()
    }
}

/// Helper: dump `(hash, number, position)` triples into a fresh table.
pub(crate) fn make_table(
    names: &dyn FileNameProvider,
    entries: &[(u64, i64, i64)],
) -> Result<Arc<PTable>> {
    let mut mem = MemTable::new(entries.len().max(1));
    for &(h, n, p) in entries {
        mem.add(IndexEntry::new(h, n, p));
    }
    let table = PTable::from_memtable(
        &mem,
        &names.next_path(),
        CURRENT_VERSION,
        &TableOptions::default(),
    )?;
    Ok(Arc::new(table))
}

/// Runs `f` with oracles that keep every entry.
pub(crate) fn with_ctx<R>(names: &dyn FileNameProvider, f: impl FnOnce(&MergeContext<'_>) -> R) -> R {
    let exists = |_: &IndexEntry| true;
    let resolve = |e: &IndexEntry| (format!("stream-{}", e.stream_hash), true);
    let hasher = IndexHasher::default();
    let opts = TableOptions::default();
    let ctx = MergeContext {
        oracles: MergeOracles {
            exists_at: &exists,
            resolve_collision: &resolve,
            hash_upgrade: &hasher,
        },
        file_names: names,
        version: CURRENT_VERSION,
        table_options: &opts,
    };
    f(&ctx)
}

pub(crate) fn load_options() -> LoadOptions {
    LoadOptions {
        table_options: TableOptions::default(),
        initialization_threads: 2,
    }
}

pub(crate) fn files_in(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
