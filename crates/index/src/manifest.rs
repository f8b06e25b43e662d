/// # Manifest - Persistent Table-to-Level Map
///
/// Records which table files make up the index, the level each belongs to,
/// and the log checkpoints the index covers.
///
/// ## File Format
///
/// ```text
/// 1F3A09BC                         <- CRC32 of everything below this line
/// 2                                <- manifest format version
/// 5120/5040                        <- prepare_checkpoint/commit_checkpoint
/// 2                                <- max_auto_merge_level when saved
/// 0;3b0c5a9e-...;1000000           <- level;file_name;entry_count
/// 1;77de1f02-...;2000000
/// ```
///
/// Table lines are ordered by level, then by arrival within the level.
///
/// ## Crash Safety
///
/// Saves write a uniquely named temp file, fsync it, then rename it over the
/// manifest, so a reader only ever sees a complete old or complete new file.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::{IndexError, Result};

/// Name of the manifest file within the index directory.
pub const MANIFEST_FILENAME: &str = "indexmap";

/// Version written on the second line.
pub const MANIFEST_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTable {
    pub level: u32,
    /// Base name of the table file inside the index directory.
    pub file_name: String,
    pub entry_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub prepare_checkpoint: i64,
    pub commit_checkpoint: i64,
    pub max_auto_merge_level: u32,
    pub tables: Vec<ManifestTable>,
}

impl Manifest {
    /// Reads the manifest at `path`. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .map(Some)
                .map_err(|e| prefix_error(path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(IndexError::Corrupt(
                format!("{}: manifest is not valid text", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (checksum_line, body) = text
            .split_once('\n')
            .ok_or_else(|| corrupt("manifest is empty or truncated".to_string()))?;
        let stored = u32::from_str_radix(checksum_line.trim(), 16)
            .map_err(|_| corrupt(format!("bad checksum line {:?}", checksum_line)))?;
        let actual = crc32fast::hash(body.as_bytes());
        if stored != actual {
            return Err(corrupt(format!(
                "checksum mismatch: stored {:08X}, computed {:08X}",
                stored, actual
            )));
        }

        let mut lines = body.lines();
        let mut next_line = |what: &str| {
            lines
                .next()
                .ok_or_else(|| corrupt(format!("missing {} line", what)))
        };

        let version: u32 = parse_field(next_line("version")?, "version")?;
        if version != MANIFEST_VERSION {
            return Err(corrupt(format!("unsupported manifest version {}", version)));
        }

        let checkpoints = next_line("checkpoint")?;
        let (prepare, commit) = checkpoints
            .split_once('/')
            .ok_or_else(|| corrupt(format!("bad checkpoint line {:?}", checkpoints)))?;
        let prepare_checkpoint: i64 = parse_field(prepare, "prepare checkpoint")?;
        let commit_checkpoint: i64 = parse_field(commit, "commit checkpoint")?;
        if prepare_checkpoint < -1 || commit_checkpoint < -1 {
            return Err(corrupt(format!(
                "invalid checkpoints {}/{}",
                prepare_checkpoint, commit_checkpoint
            )));
        }

        let max_auto_merge_level: u32 =
            parse_field(next_line("max auto merge level")?, "max auto merge level")?;

        let mut tables: Vec<ManifestTable> = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split(';');
            let (Some(level), Some(file_name), Some(count), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(corrupt(format!("bad table line {:?}", line)));
            };
            let level: u32 = parse_field(level, "level")?;
            let entry_count: u64 = parse_field(count, "entry count")?;
            if file_name.is_empty() || file_name.contains(['/', '\\']) {
                return Err(corrupt(format!("bad table file name {:?}", file_name)));
            }
            if tables.last().map_or(false, |t| t.level > level) {
                return Err(corrupt(format!("table line out of level order: {:?}", line)));
            }
            tables.push(ManifestTable {
                level,
                file_name: file_name.to_string(),
                entry_count,
            });
        }

        if !tables.is_empty() && (prepare_checkpoint < 0 || commit_checkpoint < 0) {
            return Err(corrupt(format!(
                "negative checkpoints {}/{} with {} tables",
                prepare_checkpoint,
                commit_checkpoint,
                tables.len()
            )));
        }

        Ok(Self {
            prepare_checkpoint,
            commit_checkpoint,
            max_auto_merge_level,
            tables,
        })
    }

    /// Serializes the manifest, checksum line included.
    #[must_use]
    pub fn render(&self) -> String {
        let mut body = format!(
            "{}\n{}/{}\n{}\n",
            MANIFEST_VERSION, self.prepare_checkpoint, self.commit_checkpoint, self.max_auto_merge_level
        );
        for t in &self.tables {
            body.push_str(&format!("{};{};{}\n", t.level, t.file_name, t.entry_count));
        }
        format!("{:08X}\n{}", crc32fast::hash(body.as_bytes()), body)
    }

    /// Atomically replaces the manifest at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = tmp_path_for(path);
        let write = || -> io::Result<()> {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.flush()?;
            f.sync_all()?;
            fs::rename(&tmp_path, path)?;
            if let Some(parent) = path.parent() {
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
            Ok(())
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        tracing::debug!(
            path = %path.display(),
            tables = self.tables.len(),
            prepare = self.prepare_checkpoint,
            commit = self.commit_checkpoint,
            "saved manifest"
        );
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{}.tmp", Uuid::new_v4()));
    PathBuf::from(p)
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| corrupt(format!("bad {} {:?}", what, raw)))
}

fn corrupt(msg: String) -> IndexError {
    IndexError::Corrupt(msg)
}

fn prefix_error(path: &Path, e: IndexError) -> IndexError {
    match e {
        IndexError::Corrupt(msg) => IndexError::Corrupt(format!("{}: {}", path.display(), msg)),
        other => other,
    }
}
