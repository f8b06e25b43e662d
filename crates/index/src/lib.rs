//! # Index - Leveled Event Index
//!
//! Maps `(stream, event_number)` to positions in the transaction log using a
//! log-structured merge design built from the [`memtable`] and [`ptable`]
//! crates.
//!
//! ## Architecture
//!
//! ```text
//! add / add_entries
//!   |
//!   v
//! ┌─────────────────────────────────────────────┐
//! │                TABLE INDEX                  │
//! │                                             │
//! │ MemTable (bounded) ── full? ──> PTable      │
//! │                                   |         │
//! │                                   v         │
//! │ LeveledIndex.add_table(level 0) -> cascade  │
//! │   level 0: [t t]  ──merge──> level 1: [t]   │
//! │   ...                                       │
//! │   level >= max_auto_merge_level: manual     │
//! │                                   |         │
//! │                                   v         │
//! │ manifest saved ─> snapshot published        │
//! │             ─> superseded tables retired    │
//! │                                             │
//! │ reads: MemTable -> tables newest first      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                              |
//! |-----------------|------------------------------------------------------|
//! | [`index_map`]   | `LeveledIndex`: copy-on-write level catalog, merges  |
//! | [`compaction`]  | When a level merges, where a manual merge lands      |
//! | [`manifest`]    | Text manifest with checksum, atomic save             |
//! | [`hasher`]      | Stream name hashing and version upgrade              |
//! | [`naming`]      | File names for new tables                            |
//! | `table_index`   | `TableIndex` struct, open/close, stats               |
//! | `write`         | add, flush, manual merge, scavenge                   |
//! | `read`          | point, latest and range lookups                      |
//! | `recovery`      | load or rebuild, stray file cleanup                  |

pub mod compaction;
mod error;
pub mod hasher;
pub mod index_map;
pub mod manifest;
pub mod naming;
mod read;
mod recovery;
mod table_index;
mod write;

pub use compaction::CompactionPolicy;
pub use error::{IndexError, Result};
pub use hasher::{IndexHasher, StreamHasher, XxHasher};
pub use index_map::{LeveledIndex, LoadOptions, MergeContext, MergeResult, ScavengeResult};
pub use manifest::{Manifest, ManifestTable, MANIFEST_FILENAME};
pub use naming::{FileNameProvider, GuidFileNameProvider, SequentialFileNameProvider};
pub use table_index::{IndexKey, IndexStats, LogReader, TableIndex};

pub use config::IndexConfig;
pub use memtable::{IndexEntry, MemTable};
pub use ptable::{
    ExistsAt, HashUpgrade, LeaseMode, MergeOracles, PTable, PTableError, ResolveCollision,
    TableOptions, CURRENT_VERSION, PTABLE_VERSION_32BIT, PTABLE_VERSION_64BIT,
};

#[cfg(test)]
mod tests;
