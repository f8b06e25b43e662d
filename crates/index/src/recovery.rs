use config::IndexConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::index_map::{LeveledIndex, LoadOptions};
use crate::manifest::MANIFEST_FILENAME;
use crate::naming::is_table_file_name;
use crate::table_index::TableIndex;
use crate::{IndexError, Result};

impl TableIndex {
    /// Loads the index map, or wipes the directory and starts empty when the
    /// on-disk index cannot be trusted.
    pub(crate) fn load_or_rebuild(
        config: &IndexConfig,
        manifest_path: &Path,
        load: &LoadOptions,
        chaser_checkpoint: i64,
    ) -> Result<LeveledIndex> {
        let loaded = LeveledIndex::from_file(
            manifest_path,
            config.max_tables_per_level,
            config.max_auto_merge_level,
            load,
        )
        .and_then(|map| {
            if !map.is_empty() && map.commit_checkpoint() >= chaser_checkpoint {
                map.dispose(config.dispose_timeout);
                return Err(IndexError::Corrupt(format!(
                    "index commit checkpoint {} is not below log checkpoint {}",
                    map.commit_checkpoint(),
                    chaser_checkpoint
                )));
            }
            Ok(map)
        });

        match loaded {
            Ok(map) => Ok(map),
            Err(e) if e.is_corrupt() => {
                tracing::error!(
                    dir = %config.index_dir.display(),
                    error = %e,
                    "index is corrupt, discarding it; it will be rebuilt from the log"
                );
                wipe_dir(&config.index_dir)?;
                LeveledIndex::empty(config.max_tables_per_level, config.max_auto_merge_level)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes index files in the index directory that `map` does not
    /// reference: temp files from interrupted writes and tables orphaned by a
    /// crash between a merge and the manifest save.
    ///
    /// Only names the index itself produces are touched, so other files
    /// sharing the directory survive. Tables named by a custom
    /// [`FileNameProvider`](crate::naming::FileNameProvider) are never
    /// recognised as strays.
    pub(crate) fn remove_stray_files(dir: &Path, map: &LeveledIndex) {
        let mut keep: HashSet<String> = HashSet::new();
        keep.insert(MANIFEST_FILENAME.to_string());
        for name in map.all_file_names() {
            keep.insert(format!("{}{}", name, bloom::SIDECAR_SUFFIX));
            keep.insert(name);
        }

        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) || !is_index_file(&name) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "removed stray index file"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove stray index file"),
            }
        }
    }
}

/// Removes every index file in `dir`, leaving foreign files alone.
fn wipe_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_file() && is_index_file(&entry.file_name().to_string_lossy()) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Manifest, tables, bloom sidecars and the temp files of each.
fn is_index_file(name: &str) -> bool {
    let name = name.strip_suffix(".tmp").unwrap_or(name);
    let name = name.strip_suffix(bloom::SIDECAR_SUFFIX).unwrap_or(name);
    if name == MANIFEST_FILENAME || is_table_file_name(name) {
        return true;
    }
    name.strip_prefix(MANIFEST_FILENAME)
        .and_then(|rest| rest.strip_prefix('.'))
        .map_or(false, |id| Uuid::parse_str(id).is_ok())
}
