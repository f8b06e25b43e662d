use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Hands out fresh, unused paths for new table files.
pub trait FileNameProvider: Send + Sync {
    fn next_path(&self) -> PathBuf;
}

impl<F: Fn() -> PathBuf + Send + Sync> FileNameProvider for F {
    fn next_path(&self) -> PathBuf {
        self()
    }
}

/// Random UUID file names inside one directory.
#[derive(Debug, Clone)]
pub struct GuidFileNameProvider {
    dir: PathBuf,
}

impl GuidFileNameProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FileNameProvider for GuidFileNameProvider {
    fn next_path(&self) -> PathBuf {
        self.dir.join(Uuid::new_v4().to_string())
    }
}

/// Sequential names (`table-000001`, ...); handy where names must be
/// predictable. Numbers already taken on disk are skipped, so a provider
/// created over an existing directory never hands out a live table's name.
#[derive(Debug)]
pub struct SequentialFileNameProvider {
    dir: PathBuf,
    next: AtomicU64,
}

impl SequentialFileNameProvider {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            next: AtomicU64::new(1),
        }
    }
}

impl FileNameProvider for SequentialFileNameProvider {
    fn next_path(&self) -> PathBuf {
        loop {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            let path = self.dir.join(format!("table-{:06}", n));
            if !path.exists() {
                return path;
            }
        }
    }
}

/// Whether `name` is one the built-in providers hand out.
pub(crate) fn is_table_file_name(name: &str) -> bool {
    if Uuid::parse_str(name).is_ok() {
        return true;
    }
    name.strip_prefix("table-")
        .map_or(false, |n| n.len() >= 6 && n.bytes().all(|b| b.is_ascii_digit()))
}
