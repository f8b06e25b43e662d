use memtable::{IndexEntry, MemTable};
use parking_lot::MutexGuard;
use ptable::PTable;
use std::sync::Arc;
use std::time::Instant;

use crate::index_map::{LeveledIndex, ScavengeResult};
use crate::table_index::{IndexKey, TableIndex, WriterState};
use crate::{IndexError, Result};

impl TableIndex {
    /// Indexes one event. `commit_position` is the log position of the commit
    /// that made it durable.
    pub fn add(
        &self,
        commit_position: i64,
        stream: &str,
        event_number: i64,
        position: i64,
    ) -> Result<()> {
        self.add_entries(
            commit_position,
            &[IndexKey {
                stream,
                event_number,
                position,
            }],
        )
    }

    /// Indexes a batch of events committed at `commit_position`, flushing the
    /// MemTable once it is full.
    pub fn add_entries(&self, commit_position: i64, entries: &[IndexKey<'_>]) -> Result<()> {
        if commit_position < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "commit position must be non-negative, got {}",
                commit_position
            )));
        }
        if let Some(bad) = entries
            .iter()
            .find(|k| k.event_number < 0 || k.position < 0)
        {
            return Err(IndexError::InvalidArgument(format!(
                "negative event number or position in {:?}",
                bad
            )));
        }

        let mut writer = self.writer.lock();
        let full = {
            let mut mem = self.memtable.write();
            for k in entries {
                mem.add(IndexEntry::new(
                    self.entry_hash(k.stream),
                    k.event_number,
                    k.position,
                ));
            }
            mem.is_full()
        };
        writer.last_commit_position = writer.last_commit_position.max(commit_position);

        if full {
            self.flush_locked(&mut writer)?;
        }
        Ok(())
    }

    /// Dumps the MemTable to a table even if it is not full. Returns `false`
    /// when there was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        let mut writer = self.writer.lock();
        self.flush_locked(&mut writer)
    }

    /// Merges every table at or above `max_auto_merge_level` into one.
    /// Returns `false` when fewer than two such tables exist.
    pub fn merge_indexes(&self) -> Result<bool> {
        let mut writer = self.writer.lock();
        let current = self.snapshot();
        let result = self.with_merge_context(|ctx| current.try_manual_merge(ctx))?;
        match result {
            Some(r) => {
                self.publish(&mut writer, &current, r.merged_map, r.to_delete, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rewrites every table keeping only entries `should_keep` accepts.
    /// Returns the number of entries removed.
    pub fn scavenge(&self, should_keep: &dyn Fn(&IndexEntry) -> bool) -> Result<u64> {
        let mut writer = self.writer.lock();
        let started = Instant::now();
        let ids: Vec<_> = self.snapshot().in_order().map(|t| t.id()).collect();

        let mut removed = 0u64;
        for id in ids {
            let current = self.snapshot();
            let outcome = self.with_merge_context(|ctx| current.scavenge(id, should_keep, ctx))?;
            if let ScavengeResult::Scavenged {
                merged_map,
                old_table,
                entries_removed,
            } = outcome
            {
                self.publish(&mut writer, &current, merged_map, vec![old_table], false)?;
                removed += entries_removed;
            }
        }
        tracing::info!(
            removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index scavenge finished"
        );
        Ok(removed)
    }

    fn flush_locked(&self, writer: &mut MutexGuard<'_, WriterState>) -> Result<bool> {
        let started = Instant::now();
        let (table, prepare) = {
            let mem = self.memtable.read();
            let Some(prepare) = mem.max_log_position() else {
                return Ok(false);
            };
            let path = self.file_names.next_path();
            let table = PTable::from_memtable(
                &mem,
                &path,
                self.config.table_version,
                &self.table_options,
            )?;
            (Arc::new(table), prepare)
        };
        let commit = writer.last_commit_position.max(prepare);

        let current = self.snapshot();
        let result = self.with_merge_context(|ctx| {
            current.add_table(Arc::clone(&table), prepare, commit, 0, ctx)
        });
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                table.mark_for_destruction();
                return Err(e);
            }
        };
        self.publish(writer, &current, result.merged_map, result.to_delete, true)?;

        tracing::info!(
            entries = table.count(),
            prepare,
            commit,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "memtable flushed"
        );
        Ok(true)
    }

    /// Persists `next`, makes it the live index and retires `to_delete`.
    fn publish(
        &self,
        writer: &mut MutexGuard<'_, WriterState>,
        current: &LeveledIndex,
        next: LeveledIndex,
        to_delete: Vec<Arc<PTable>>,
        reset_memtable: bool,
    ) -> Result<()> {
        if let Err(e) = next.save_to_file(&self.manifest_path) {
            // Tables only `next` knows about would otherwise leak.
            for t in next.in_order() {
                if current.level_of(t.id()).is_none() {
                    t.mark_for_destruction();
                }
            }
            return Err(e);
        }

        {
            let mut mem = self.memtable.write();
            let mut index = self.index.write();
            if reset_memtable {
                *mem = MemTable::new(self.config.max_memtable_entries);
            }
            *index = Arc::new(next);
        }

        let now = Instant::now();
        for t in to_delete {
            t.mark_for_destruction();
            if !t.is_destroyed() {
                writer.retired.push((t, now));
            }
        }
        self.sweep_retired(writer);
        Ok(())
    }

    /// Forgets retired tables that are gone and warns about stragglers.
    fn sweep_retired(&self, writer: &mut MutexGuard<'_, WriterState>) {
        let timeout = self.config.destruction_timeout;
        writer.retired.retain(|(t, since)| {
            if t.is_destroyed() {
                return false;
            }
            if since.elapsed() >= timeout {
                tracing::warn!(
                    path = %t.path().display(),
                    readers = t.leased_readers(),
                    waited_ms = since.elapsed().as_millis() as u64,
                    "retired table still has readers"
                );
            }
            true
        });
    }
}
