use memtable::{IndexEntry, MemTable};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::index_map::LeveledIndex;
use crate::table_index::TableIndex;
use crate::Result;

/// Attempts before a read gives up racing table retirement.
const MAX_READ_ATTEMPTS: usize = 5;

impl TableIndex {
    /// Log position of event `event_number` of `stream`.
    pub fn try_get_one_value(&self, stream: &str, event_number: i64) -> Result<Option<i64>> {
        let full = self.hasher.hash(stream);
        let own = self.entry_hash(stream);
        self.with_retry(|| {
            let (hit, snap) = self.view(|mem| mem.get(own, event_number));
            if hit.is_some() {
                return Ok(hit);
            }
            for t in snap.newest_first() {
                if let Some(p) = t.lookup_one(full, event_number)? {
                    return Ok(Some(p));
                }
            }
            Ok(None)
        })
    }

    /// The highest-numbered indexed event of `stream`.
    pub fn try_get_latest_entry(&self, stream: &str) -> Result<Option<IndexEntry>> {
        let full = self.hasher.hash(stream);
        let own = self.entry_hash(stream);
        self.with_retry(|| {
            let (hit, snap) = self.view(|mem| mem.latest(own));
            if hit.is_some() {
                return Ok(hit);
            }
            for t in snap.newest_first() {
                if let Some(e) = t.latest_entry(full)? {
                    return Ok(Some(IndexEntry::new(own, e.event_number, e.log_position)));
                }
            }
            Ok(None)
        })
    }

    /// Events of `stream` numbered `from..=to`, ascending. When several
    /// sources hold the same event the newest wins.
    pub fn get_range(&self, stream: &str, from: i64, to: i64) -> Result<Vec<IndexEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        let full = self.hasher.hash(stream);
        let own = self.entry_hash(stream);
        self.with_retry(|| {
            let (mut found, snap): (BTreeMap<i64, i64>, _) = self.view(|mem| {
                mem.range(own, from..=to)
                    .map(|e| (e.event_number, e.log_position))
                    .collect()
            });
            for t in snap.newest_first() {
                let range = t.lookup_range(full, from, to)?;
                for e in range.iter()? {
                    let e = e?;
                    found.entry(e.event_number).or_insert(e.log_position);
                }
            }
            Ok(found
                .into_iter()
                .map(|(n, p)| IndexEntry::new(own, n, p))
                .collect())
        })
    }

    /// Reads the MemTable and takes a snapshot under the same locks, so the
    /// pair never straddles a flush.
    fn view<T>(&self, f: impl FnOnce(&MemTable) -> T) -> (T, Arc<LeveledIndex>) {
        let mem = self.memtable.read();
        let snap = Arc::clone(&self.index.read());
        (f(&mem), snap)
    }

    /// Retries `read` when a table was retired underneath it.
    fn with_retry<T>(&self, read: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match read() {
                Err(e) if e.is_table_retired() && attempt < MAX_READ_ATTEMPTS => {
                    tracing::debug!(attempt, "table retired during read, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
