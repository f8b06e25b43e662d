use config::IndexConfig;
use memtable::{IndexEntry, MemTable};
use parking_lot::{Mutex, RwLock};
use ptable::{MergeOracles, PTable, TableOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::hasher::IndexHasher;
use crate::index_map::{LeveledIndex, LoadOptions, MergeContext};
use crate::manifest::MANIFEST_FILENAME;
use crate::naming::{FileNameProvider, GuidFileNameProvider};
use crate::Result;

/// Access to the transaction log the index points into.
pub trait LogReader: Send + Sync {
    /// Whether a record still exists at `position`.
    fn exists_at(&self, position: i64) -> bool;

    /// Stream name of the record at `position`.
    fn read_stream(&self, position: i64) -> Option<String>;
}

/// One event to index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexKey<'a> {
    pub stream: &'a str,
    pub event_number: i64,
    pub position: i64,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub memtable_entries: usize,
    pub level_sizes: Vec<usize>,
    pub table_count: usize,
    pub prepare_checkpoint: i64,
    pub commit_checkpoint: i64,
}

pub(crate) struct WriterState {
    pub(crate) last_commit_position: i64,
    /// Tables marked for destruction that still have readers.
    pub(crate) retired: Vec<(Arc<PTable>, Instant)>,
}

/// The event index: a MemTable in front of a leveled set of tables.
///
/// # Write Path
///
/// 1. Entries are hashed and added to the MemTable.
/// 2. When the MemTable is full it is dumped to a table, which is added at
///    level 0 of the leveled index; merges cascade as needed.
/// 3. The new index is saved to the manifest and then published; tables it
///    no longer references are marked for destruction.
///
/// # Read Path
///
/// The MemTable is consulted first, then the tables of the current snapshot
/// from newest to oldest. Readers on other threads can hold a snapshot via
/// [`TableIndex::snapshot`] for as long as they like.
///
/// # Recovery
///
/// [`TableIndex::open`] loads the manifest. A corrupt index is wiped and the
/// index starts empty with `commit_checkpoint() == -1`; the caller replays
/// the log from there.
pub struct TableIndex {
    pub(crate) config: IndexConfig,
    pub(crate) table_options: TableOptions,
    pub(crate) manifest_path: PathBuf,
    pub(crate) hasher: IndexHasher,
    pub(crate) log: Arc<dyn LogReader>,
    pub(crate) file_names: Box<dyn FileNameProvider>,
    pub(crate) memtable: RwLock<MemTable>,
    pub(crate) index: RwLock<Arc<LeveledIndex>>,
    /// Serializes add, flush, merge and scavenge.
    pub(crate) writer: Mutex<WriterState>,
}

impl std::fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("TableIndex")
            .field("dir", &self.config.index_dir)
            .field("memtable_entries", &stats.memtable_entries)
            .field("level_sizes", &stats.level_sizes)
            .field("prepare_checkpoint", &stats.prepare_checkpoint)
            .field("commit_checkpoint", &stats.commit_checkpoint)
            .finish()
    }
}

impl TableIndex {
    /// Opens the index in `config.index_dir` with random table file names and
    /// the default hasher.
    ///
    /// `chaser_checkpoint` is the log position up to which the log is known
    /// to be durable; an index claiming to cover more than that is discarded.
    pub fn open(config: IndexConfig, log: Arc<dyn LogReader>, chaser_checkpoint: i64) -> Result<Self> {
        let names = Box::new(GuidFileNameProvider::new(config.index_dir.clone()));
        Self::open_with(config, log, chaser_checkpoint, names, IndexHasher::default())
    }

    pub fn open_with(
        config: IndexConfig,
        log: Arc<dyn LogReader>,
        chaser_checkpoint: i64,
        file_names: Box<dyn FileNameProvider>,
        hasher: IndexHasher,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.index_dir)?;

        let table_options = TableOptions {
            cache_depth: config.index_cache_depth,
            skip_verify: config.skip_index_verify,
            use_bloom_filter: config.use_bloom_filter,
            initial_readers: config.initial_reader_count,
            max_readers: config.max_reader_count,
        };
        let load = LoadOptions {
            table_options: table_options.clone(),
            initialization_threads: config.initialization_threads,
        };
        let manifest_path = config.index_dir.join(MANIFEST_FILENAME);
        let map = Self::load_or_rebuild(&config, &manifest_path, &load, chaser_checkpoint)?;
        Self::remove_stray_files(&config.index_dir, &map);

        let memtable = MemTable::new(config.max_memtable_entries);
        let last_commit_position = map.commit_checkpoint();
        Ok(Self {
            config,
            table_options,
            manifest_path,
            hasher,
            log,
            file_names,
            memtable: RwLock::new(memtable),
            index: RwLock::new(Arc::new(map)),
            writer: Mutex::new(WriterState {
                last_commit_position,
                retired: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.index_dir
    }

    /// The currently published leveled index.
    #[must_use]
    pub fn snapshot(&self) -> Arc<LeveledIndex> {
        Arc::clone(&self.index.read())
    }

    #[must_use]
    pub fn prepare_checkpoint(&self) -> i64 {
        self.snapshot().prepare_checkpoint()
    }

    #[must_use]
    pub fn commit_checkpoint(&self) -> i64 {
        self.snapshot().commit_checkpoint()
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let memtable_entries = self.memtable.read().len();
        let snap = self.snapshot();
        IndexStats {
            memtable_entries,
            level_sizes: snap.level_sizes(),
            table_count: snap.table_count(),
            prepare_checkpoint: snap.prepare_checkpoint(),
            commit_checkpoint: snap.commit_checkpoint(),
        }
    }

    /// Retires every table, waiting up to `dispose_timeout` for readers.
    /// With `remove_files` the manifest and all table files are deleted too.
    pub fn close(&self, remove_files: bool) -> Result<()> {
        let snap = self.snapshot();
        if !snap.dispose(self.config.dispose_timeout) {
            tracing::warn!(
                timeout_ms = self.config.dispose_timeout.as_millis() as u64,
                "closing index with readers still active"
            );
        }
        if remove_files {
            for t in snap.in_order() {
                let _ = fs::remove_file(t.path());
                let _ = fs::remove_file(bloom::sidecar_path(t.path()));
            }
            match fs::remove_file(&self.manifest_path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        tracing::info!(dir = %self.config.index_dir.display(), remove_files, "index closed");
        Ok(())
    }

    /// Hash of `stream` as stored in the MemTable and new tables.
    pub(crate) fn entry_hash(&self, stream: &str) -> u64 {
        self.hasher
            .hash_for_version(stream, self.config.table_version)
    }

    /// Runs `f` with merge callbacks backed by the log and the hasher.
    pub(crate) fn with_merge_context<R>(&self, f: impl FnOnce(&MergeContext<'_>) -> R) -> R {
        let exists = |e: &IndexEntry| self.log.exists_at(e.log_position);
        let resolve = |e: &IndexEntry| match self.log.read_stream(e.log_position) {
            Some(name) => {
                let owns = self.hasher.matches(&name, e.stream_hash);
                (name, owns)
            }
            None => (String::new(), false),
        };
        let ctx = MergeContext {
            oracles: MergeOracles {
                exists_at: &exists,
                resolve_collision: &resolve,
                hash_upgrade: &self.hasher,
            },
            file_names: self.file_names.as_ref(),
            version: self.config.table_version,
            table_options: &self.table_options,
        };
        f(&ctx)
    }
}
