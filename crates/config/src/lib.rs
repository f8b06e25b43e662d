//! # Config - Index Tunables
//!
//! [`IndexConfig`] gathers every knob of the event index: where the files
//! live, how large the in-memory buffer grows, the shape of the level
//! structure, reader pool sizes and recovery parallelism.
//!
//! Values come from [`Default`], builder setters, or `ESIDX_*` environment
//! variables ([`IndexConfig::from_env`]). Call [`IndexConfig::validate`]
//! before handing a config to the index.
//!
//! ```text
//! ESIDX_DIR                    index directory                  (default: "data/index")
//! ESIDX_MEMTABLE_ENTRIES       entries per memtable             (default: 1000000)
//! ESIDX_TABLES_PER_LEVEL       merge threshold per level        (default: 2)
//! ESIDX_MAX_AUTO_MERGE_LEVEL   highest auto-merged level        (default: 2, 0 = manual only)
//! ESIDX_CACHE_DEPTH            midpoint cache depth             (default: 16)
//! ESIDX_SKIP_VERIFY            skip checksum on load            (default: false)
//! ESIDX_BLOOM                  write/read bloom sidecars        (default: true)
//! ESIDX_INITIAL_READERS        readers opened per table         (default: 5)
//! ESIDX_MAX_READERS            reader cap per table             (default: 96)
//! ESIDX_INIT_THREADS           threads for table loading        (default: 1)
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Current on-disk table version (64-bit stream hashes).
pub const DEFAULT_TABLE_VERSION: u8 = 2;

/// Deepest supported midpoint cache (2^28 cached keys).
pub const MAX_CACHE_DEPTH: u32 = 28;

/// Errors raised for invalid tunables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid option {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("cannot parse {var}={value:?}: {reason}")]
    Parse {
        var: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    /// Directory holding tables, sidecars and the manifest.
    pub index_dir: PathBuf,

    /// MemTable capacity in entries.
    pub max_memtable_entries: usize,

    /// A level merges once it holds this many tables.
    pub max_tables_per_level: usize,

    /// Levels at or above this are only merged on request. Zero disables
    /// automatic merging.
    pub max_auto_merge_level: u32,

    /// Midpoint cache holds up to `2^depth` keys per table.
    pub index_cache_depth: u32,

    /// Skip the whole-file checksum when opening tables.
    pub skip_index_verify: bool,

    pub use_bloom_filter: bool,

    /// File handles opened eagerly for each table.
    pub initial_reader_count: usize,

    /// Upper bound on concurrent readers per table.
    pub max_reader_count: usize,

    /// Threads used to open tables on startup.
    pub initialization_threads: usize,

    /// Format version for newly written tables.
    pub table_version: u8,

    /// How long `close` waits for outstanding readers.
    pub dispose_timeout: Duration,

    /// How long a retired table may linger before a warning is logged.
    pub destruction_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("data/index"),
            max_memtable_entries: 1_000_000,
            max_tables_per_level: 2,
            max_auto_merge_level: 2,
            index_cache_depth: 16,
            skip_index_verify: false,
            use_bloom_filter: true,
            initial_reader_count: 5,
            max_reader_count: 96,
            initialization_threads: 1,
            table_version: DEFAULT_TABLE_VERSION,
            dispose_timeout: Duration::from_secs(5),
            destruction_timeout: Duration::from_secs(10),
        }
    }
}

impl IndexConfig {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ..Default::default()
        }
    }

    pub fn max_memtable_entries(mut self, n: usize) -> Self {
        self.max_memtable_entries = n;
        self
    }

    pub fn max_tables_per_level(mut self, n: usize) -> Self {
        self.max_tables_per_level = n;
        self
    }

    pub fn max_auto_merge_level(mut self, level: u32) -> Self {
        self.max_auto_merge_level = level;
        self
    }

    pub fn index_cache_depth(mut self, depth: u32) -> Self {
        self.index_cache_depth = depth;
        self
    }

    pub fn skip_index_verify(mut self, skip: bool) -> Self {
        self.skip_index_verify = skip;
        self
    }

    pub fn use_bloom_filter(mut self, enabled: bool) -> Self {
        self.use_bloom_filter = enabled;
        self
    }

    pub fn reader_counts(mut self, initial: usize, max: usize) -> Self {
        self.initial_reader_count = initial;
        self.max_reader_count = max;
        self
    }

    pub fn initialization_threads(mut self, n: usize) -> Self {
        self.initialization_threads = n;
        self
    }

    pub fn table_version(mut self, version: u8) -> Self {
        self.table_version = version;
        self
    }

    pub fn dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    pub fn destruction_timeout(mut self, timeout: Duration) -> Self {
        self.destruction_timeout = timeout;
        self
    }

    /// Checks every tunable and reports the first offending one.
    pub fn validate(&self) -> Result<()> {
        if self.max_tables_per_level < 2 {
            return Err(invalid(
                "max_tables_per_level",
                format!("must be at least 2, got {}", self.max_tables_per_level),
            ));
        }
        if self.max_memtable_entries == 0 {
            return Err(invalid("max_memtable_entries", "must be positive".into()));
        }
        if self.initial_reader_count == 0 {
            return Err(invalid("initial_reader_count", "must be positive".into()));
        }
        if self.max_reader_count < self.initial_reader_count {
            return Err(invalid(
                "max_reader_count",
                format!(
                    "{} is below initial_reader_count {}",
                    self.max_reader_count, self.initial_reader_count
                ),
            ));
        }
        if self.initialization_threads == 0 {
            return Err(invalid("initialization_threads", "must be positive".into()));
        }
        if self.index_cache_depth > MAX_CACHE_DEPTH {
            return Err(invalid(
                "index_cache_depth",
                format!("must be at most {}, got {}", MAX_CACHE_DEPTH, self.index_cache_depth),
            ));
        }
        if !(1..=DEFAULT_TABLE_VERSION).contains(&self.table_version) {
            return Err(invalid(
                "table_version",
                format!("unknown table version {}", self.table_version),
            ));
        }
        Ok(())
    }

    /// Builds a config from `ESIDX_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](IndexConfig::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(dir) = lookup("ESIDX_DIR") {
            cfg.index_dir = PathBuf::from(dir);
        }
        parse_var(&lookup, "ESIDX_MEMTABLE_ENTRIES", &mut cfg.max_memtable_entries)?;
        parse_var(&lookup, "ESIDX_TABLES_PER_LEVEL", &mut cfg.max_tables_per_level)?;
        parse_var(&lookup, "ESIDX_MAX_AUTO_MERGE_LEVEL", &mut cfg.max_auto_merge_level)?;
        parse_var(&lookup, "ESIDX_CACHE_DEPTH", &mut cfg.index_cache_depth)?;
        parse_var(&lookup, "ESIDX_SKIP_VERIFY", &mut cfg.skip_index_verify)?;
        parse_var(&lookup, "ESIDX_BLOOM", &mut cfg.use_bloom_filter)?;
        parse_var(&lookup, "ESIDX_INITIAL_READERS", &mut cfg.initial_reader_count)?;
        parse_var(&lookup, "ESIDX_MAX_READERS", &mut cfg.max_reader_count)?;
        parse_var(&lookup, "ESIDX_INIT_THREADS", &mut cfg.initialization_threads)?;
        Ok(cfg)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(var) {
        *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
            var: var.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn invalid(name: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { name, reason }
}
