//! The leveled catalog of immutable tables.
//!
//! A [`LeveledIndex`] is a value: every mutation returns a new index and
//! leaves the receiver untouched, so readers holding an older snapshot keep
//! a consistent view. Tables are shared between snapshots through `Arc`.

use memtable::IndexEntry;
use ptable::{MergeOracles, PTable, TableOptions};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::compaction::CompactionPolicy;
use crate::manifest::{Manifest, ManifestTable};
use crate::naming::FileNameProvider;
use crate::{IndexError, Result};

/// Everything a merge needs besides the tables themselves.
#[derive(Clone, Copy)]
pub struct MergeContext<'a> {
    pub oracles: MergeOracles<'a>,
    pub file_names: &'a dyn FileNameProvider,
    /// Version of tables written by merges.
    pub version: u8,
    pub table_options: &'a TableOptions,
}

/// Outcome of [`LeveledIndex::add_table`] and friends.
#[derive(Debug)]
pub struct MergeResult {
    pub merged_map: LeveledIndex,
    /// Tables no longer referenced by `merged_map`. The caller marks them for
    /// destruction once `merged_map` is published.
    pub to_delete: Vec<Arc<PTable>>,
}

/// Outcome of [`LeveledIndex::scavenge`].
#[derive(Debug)]
pub enum ScavengeResult {
    Scavenged {
        merged_map: LeveledIndex,
        old_table: Arc<PTable>,
        entries_removed: u64,
    },
    NotScavenged,
}

/// Options for [`LeveledIndex::from_file`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub table_options: TableOptions,
    pub initialization_threads: usize,
}

#[derive(Debug, Clone)]
pub struct LeveledIndex {
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    /// `levels[l]` holds level `l`'s tables in arrival order, oldest first.
    levels: Vec<Vec<Arc<PTable>>>,
    policy: CompactionPolicy,
}

impl LeveledIndex {
    /// An index with no tables and both checkpoints at `-1`.
    ///
    /// Fails with [`IndexError::InvalidArgument`] when
    /// `max_tables_per_level < 2`.
    pub fn empty(max_tables_per_level: usize, max_auto_merge_level: u32) -> Result<Self> {
        Ok(Self {
            prepare_checkpoint: -1,
            commit_checkpoint: -1,
            levels: Vec::new(),
            policy: CompactionPolicy::new(max_tables_per_level, max_auto_merge_level)?,
        })
    }

    #[must_use]
    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    #[must_use]
    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    #[must_use]
    pub fn policy(&self) -> CompactionPolicy {
        self.policy
    }

    /// Number of levels, counting empty ones below the deepest occupied level.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn tables_at(&self, level: u32) -> &[Arc<PTable>] {
        self.levels
            .get(level as usize)
            .map_or(&[][..], |v| v.as_slice())
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table_count() == 0
    }

    /// Table counts per level.
    #[must_use]
    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// All tables, level ascending, then arrival order within each level.
    pub fn in_order(&self) -> impl Iterator<Item = &Arc<PTable>> + '_ {
        self.levels.iter().flatten()
    }

    /// All tables from the newest to the oldest: level ascending, latest
    /// arrival first within each level.
    pub fn newest_first(&self) -> impl Iterator<Item = &Arc<PTable>> + '_ {
        self.levels.iter().flat_map(|level| level.iter().rev())
    }

    #[must_use]
    pub fn all_file_names(&self) -> Vec<String> {
        self.in_order().map(|t| t.file_name()).collect()
    }

    /// Level holding the table with `id`, if any.
    #[must_use]
    pub fn level_of(&self, id: Uuid) -> Option<u32> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|t| t.id() == id))
            .map(|l| l as u32)
    }

    /// Adds `table` at `level` and runs the merge cascade.
    ///
    /// While the level a table lands on holds `max_tables_per_level` tables
    /// and sits below `max_auto_merge_level`, all its tables are merged
    /// (oldest first) into one table on the next level, and the check repeats
    /// there.
    ///
    /// Re-submitting a table that is already in the index at or above
    /// `max_auto_merge_level` (as returned by
    /// [`get_table_for_manual_merge`](Self::get_table_for_manual_merge))
    /// performs a manual merge instead.
    ///
    /// On failure any table written during this call is marked for
    /// destruction and `self` is unchanged.
    pub fn add_table(
        &self,
        table: Arc<PTable>,
        prepare_checkpoint: i64,
        commit_checkpoint: i64,
        level: u32,
        ctx: &MergeContext<'_>,
    ) -> Result<MergeResult> {
        if prepare_checkpoint < 0 || commit_checkpoint < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "checkpoints must be non-negative, got {}/{}",
                prepare_checkpoint, commit_checkpoint
            )));
        }

        let mut next = self.clone();
        next.prepare_checkpoint = prepare_checkpoint;
        next.commit_checkpoint = commit_checkpoint;

        if let Some(existing) = self.level_of(table.id()) {
            if existing < self.policy.max_auto_merge_level() {
                return Err(IndexError::InvalidArgument(format!(
                    "table {} is already at level {}",
                    table.path().display(),
                    existing
                )));
            }
            return next.manual_merge(ctx);
        }

        next.push(level, table);
        let mut to_delete = Vec::new();
        let mut created = Vec::new();
        match next.cascade(level, ctx, &mut to_delete, &mut created) {
            Ok(()) => Ok(MergeResult {
                merged_map: next,
                to_delete,
            }),
            Err(e) => {
                discard(&created);
                Err(e)
            }
        }
    }

    /// The first level at or above `max_auto_merge_level` holding two or more
    /// tables, with its newest table. `None` when every such level holds at
    /// most one table.
    ///
    /// Passing the table back to [`add_table`](Self::add_table) folds every
    /// table at or above `max_auto_merge_level` into one, placed at the
    /// deepest of those levels.
    #[must_use]
    pub fn get_table_for_manual_merge(&self) -> Option<(u32, Arc<PTable>)> {
        let level = self.policy.manual_merge_level(&self.level_sizes())?;
        let table = self.tables_at(level).last()?;
        Some((level, Arc::clone(table)))
    }

    /// Runs a manual merge through [`add_table`](Self::add_table) if one is
    /// due, keeping the current checkpoints. Returns `None` otherwise.
    pub fn try_manual_merge(&self, ctx: &MergeContext<'_>) -> Result<Option<MergeResult>> {
        match self.get_table_for_manual_merge() {
            Some((level, table)) => self
                .add_table(
                    table,
                    self.prepare_checkpoint.max(0),
                    self.commit_checkpoint.max(0),
                    level,
                    ctx,
                )
                .map(Some),
            None => Ok(None),
        }
    }

    /// Rewrites the table `id` keeping only entries `should_keep` accepts.
    /// The new table takes the old one's place in its level.
    pub fn scavenge(
        &self,
        id: Uuid,
        should_keep: &dyn Fn(&IndexEntry) -> bool,
        ctx: &MergeContext<'_>,
    ) -> Result<ScavengeResult> {
        let Some((level, pos)) = self.position_of(id) else {
            return Err(IndexError::InvalidArgument(format!("no table with id {}", id)));
        };
        let old = Arc::clone(&self.levels[level][pos]);

        let path = ctx.file_names.next_path();
        let (table, stats) = old.scavenged(&path, should_keep, ctx.table_options)?;
        if stats.entries_out == stats.entries_in {
            table.mark_for_destruction();
            return Ok(ScavengeResult::NotScavenged);
        }

        let mut next = self.clone();
        next.levels[level][pos] = Arc::new(table);
        Ok(ScavengeResult::Scavenged {
            merged_map: next,
            old_table: old,
            entries_removed: stats.entries_in - stats.entries_out,
        })
    }

    /// Persists this index to the manifest at `path`.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.to_manifest().save(path)
    }

    #[must_use]
    pub fn to_manifest(&self) -> Manifest {
        Manifest {
            prepare_checkpoint: self.prepare_checkpoint,
            commit_checkpoint: self.commit_checkpoint,
            max_auto_merge_level: self.policy.max_auto_merge_level(),
            tables: self
                .levels
                .iter()
                .enumerate()
                .flat_map(|(level, tables)| {
                    tables.iter().map(move |t| ManifestTable {
                        level: level as u32,
                        file_name: t.file_name(),
                        entry_count: t.count(),
                    })
                })
                .collect(),
        }
    }

    /// Loads the index described by the manifest at `path`, opening every
    /// table it names from the manifest's directory. A missing manifest
    /// yields an empty index.
    ///
    /// A manifest saved with a lower `max_auto_merge_level` than requested
    /// is treated as corrupt: its lower levels may hold more tables than the
    /// new limit allows, so the index has to be rebuilt.
    pub fn from_file(
        path: &Path,
        max_tables_per_level: usize,
        max_auto_merge_level: u32,
        opts: &LoadOptions,
    ) -> Result<Self> {
        let mut index = Self::empty(max_tables_per_level, max_auto_merge_level)?;
        let Some(manifest) = Manifest::load(path)? else {
            tracing::info!(path = %path.display(), "no index map found, starting empty");
            return Ok(index);
        };

        if manifest.max_auto_merge_level < max_auto_merge_level {
            return Err(IndexError::Corrupt(format!(
                "index map saved with max auto merge level {}, {} requested; index must be rebuilt",
                manifest.max_auto_merge_level, max_auto_merge_level
            )));
        }

        let started = Instant::now();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tables = open_tables(dir, &manifest.tables, opts)?;
        for (meta, table) in manifest.tables.iter().zip(tables) {
            index.push(meta.level, table);
        }
        index.prepare_checkpoint = manifest.prepare_checkpoint;
        index.commit_checkpoint = manifest.commit_checkpoint;

        tracing::info!(
            path = %path.display(),
            tables = index.table_count(),
            levels = index.level_count(),
            prepare = index.prepare_checkpoint,
            commit = index.commit_checkpoint,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded index map"
        );
        Ok(index)
    }

    /// Retires every table without deleting files, then waits up to
    /// `timeout` overall for outstanding readers. Returns `false` on timeout.
    pub fn dispose(&self, timeout: Duration) -> bool {
        for t in self.in_order() {
            t.dispose();
        }
        let deadline = Instant::now() + timeout;
        let mut all_done = true;
        for t in self.in_order() {
            let left = deadline.saturating_duration_since(Instant::now());
            if !t.wait_for_disposal(left) {
                tracing::warn!(path = %t.path().display(), "timed out waiting for table readers");
                all_done = false;
            }
        }
        all_done
    }

    // ---- Internal helpers ----

    fn push(&mut self, level: u32, table: Arc<PTable>) {
        let level = level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        self.levels[level].push(table);
    }

    fn position_of(&self, id: Uuid) -> Option<(usize, usize)> {
        self.levels.iter().enumerate().find_map(|(l, tables)| {
            tables.iter().position(|t| t.id() == id).map(|p| (l, p))
        })
    }

    fn cascade(
        &mut self,
        start: u32,
        ctx: &MergeContext<'_>,
        to_delete: &mut Vec<Arc<PTable>>,
        created: &mut Vec<Arc<PTable>>,
    ) -> Result<()> {
        let mut level = start;
        while self.policy.should_auto_merge(level, self.tables_at(level).len()) {
            let inputs = std::mem::take(&mut self.levels[level as usize]);
            tracing::debug!(level, tables = inputs.len(), "level full, merging");
            let merged = merge_into_new(&inputs, ctx)?;
            created.push(Arc::clone(&merged));
            to_delete.extend(inputs);
            self.push(level + 1, merged);
            level += 1;
        }
        Ok(())
    }

    /// Folds all tables at levels `>= max_auto_merge_level` into one table at
    /// the deepest of those levels.
    fn manual_merge(mut self, ctx: &MergeContext<'_>) -> Result<MergeResult> {
        let sizes = self.level_sizes();
        let target = self
            .policy
            .manual_merge_level(&sizes)
            .and_then(|_| self.policy.manual_merge_target(&sizes));
        let Some(target) = target else {
            return Ok(MergeResult {
                merged_map: self,
                to_delete: Vec::new(),
            });
        };

        let first = self.policy.max_auto_merge_level() as usize;
        // Oldest first: the deepest level holds the oldest data.
        let mut inputs = Vec::new();
        for level in self.levels.iter_mut().skip(first).rev() {
            inputs.append(level);
        }
        tracing::info!(level = target, tables = inputs.len(), "manual merge");

        let merged = merge_into_new(&inputs, ctx)?;
        self.push(target, Arc::clone(&merged));
        let mut to_delete = inputs;
        let mut created = vec![merged];
        if let Err(e) = self.cascade(target, ctx, &mut to_delete, &mut created) {
            discard(&created);
            return Err(e);
        }
        while self.levels.last().map_or(false, Vec::is_empty) {
            self.levels.pop();
        }
        Ok(MergeResult {
            merged_map: self,
            to_delete,
        })
    }
}

fn merge_into_new(inputs: &[Arc<PTable>], ctx: &MergeContext<'_>) -> Result<Arc<PTable>> {
    let path = ctx.file_names.next_path();
    let refs: Vec<&PTable> = inputs.iter().map(Arc::as_ref).collect();
    let (table, _) = PTable::merge(&refs, &path, ctx.version, ctx.oracles, ctx.table_options)?;
    Ok(Arc::new(table))
}

/// Removes tables written by a merge that never got published.
fn discard(created: &[Arc<PTable>]) {
    for t in created {
        t.mark_for_destruction();
    }
}

fn open_tables(dir: &Path, metas: &[ManifestTable], opts: &LoadOptions) -> Result<Vec<Arc<PTable>>> {
    let open_one = |meta: &ManifestTable| -> Result<Arc<PTable>> {
        let path = dir.join(&meta.file_name);
        if !path.exists() {
            return Err(IndexError::Corrupt(format!(
                "table {} listed in index map is missing",
                path.display()
            )));
        }
        let table = PTable::open(&path, &opts.table_options)?;
        if table.count() != meta.entry_count {
            table.dispose();
            return Err(IndexError::Corrupt(format!(
                "table {} holds {} entries, index map says {}",
                path.display(),
                table.count(),
                meta.entry_count
            )));
        }
        Ok(Arc::new(table))
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.initialization_threads.max(1))
        .build()
        .map_err(|e| IndexError::InvalidArgument(format!("cannot start loader threads: {}", e)))?;
    let results: Vec<Result<Arc<PTable>>> =
        pool.install(|| metas.par_iter().map(open_one).collect());

    let mut tables = Vec::with_capacity(results.len());
    let mut failure = None;
    for r in results {
        match r {
            Ok(t) => tables.push(t),
            Err(e) if failure.is_none() => failure = Some(e),
            Err(_) => {}
        }
    }
    if let Some(e) = failure {
        for t in &tables {
            t.dispose();
        }
        return Err(e);
    }
    Ok(tables)
}
