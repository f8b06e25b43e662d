use bloom::BloomFilter;
use memtable::IndexEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

use crate::format::{check_version, encode_record, Trailer, RECORD_SIZE};
use crate::{PTableError, Result};

/// Target false positive rate of table bloom filters.
const BLOOM_FPR: f64 = 0.01;

/// Streams sorted entries into a new table file.
///
/// Records go to `<path>.tmp`; [`finish`](TableWriter::finish) appends the
/// trailer, fsyncs, and renames the file into place. A writer dropped before
/// `finish` removes its temporary file, so a failed flush or merge never
/// leaves a half-written table under a live name.
pub(crate) struct TableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    out: Option<BufWriter<File>>,
    hasher: Xxh3,
    version: u8,
    count: u64,
    last_key: Option<(u64, i64)>,
    bloom: Option<BloomFilter>,
    last_bloom_hash: Option<u64>,
}

impl TableWriter {
    /// `expected_count` sizes the bloom filter; over-estimating is safe.
    pub(crate) fn create(
        path: &Path,
        version: u8,
        expected_count: u64,
        with_bloom: bool,
    ) -> Result<Self> {
        check_version(version)?;
        let tmp_path = tmp_path_for(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            out: Some(BufWriter::with_capacity(64 * 1024, file)),
            hasher: Xxh3::new(),
            version,
            count: 0,
            last_key: None,
            bloom: with_bloom.then(|| BloomFilter::new(expected_count as usize, BLOOM_FPR)),
            last_bloom_hash: None,
        })
    }

    /// Appends one entry. Keys must arrive strictly ascending.
    pub(crate) fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        let key = entry.key();
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(PTableError::InvalidArgument(format!(
                    "entries out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }

        let mut buf = [0u8; RECORD_SIZE as usize];
        encode_record(entry, &mut buf);
        self.hasher.update(&buf);
        self.output()?.write_all(&buf)?;

        if let Some(bloom) = self.bloom.as_mut() {
            if self.last_bloom_hash != Some(entry.stream_hash) {
                bloom.insert(entry.stream_hash);
                self.last_bloom_hash = Some(entry.stream_hash);
            }
        }

        self.last_key = Some(key);
        self.count += 1;
        Ok(())
    }

    /// Writes the trailer, makes the file durable and moves it into place.
    /// Returns the number of records written.
    pub(crate) fn finish(mut self) -> Result<u64> {
        let mut trailer = Trailer {
            entry_count: self.count,
            version: self.version,
            checksum: 0,
        };
        let prefix = trailer.encode();
        self.hasher
            .update(&prefix[..crate::format::CHECKED_TRAILER_PREFIX]);
        trailer.checksum = self.hasher.digest();

        let mut out = self
            .out
            .take()
            .ok_or_else(|| PTableError::InvalidArgument("table writer already finished".into()))?;
        out.write_all(&trailer.encode())?;
        out.flush()?;
        out.into_inner()
            .map_err(|e| PTableError::Io(e.into_error()))?
            .sync_all()?;

        fs::rename(&self.tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        if let Some(bloom) = self.bloom.take() {
            let sidecar = bloom::sidecar_path(&self.path);
            if let Err(e) = bloom.save(&sidecar) {
                tracing::warn!(path = %sidecar.display(), error = %e, "failed to write bloom filter");
            }
        }

        Ok(self.count)
    }

    fn output(&mut self) -> Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .ok_or_else(|| PTableError::InvalidArgument("table writer already finished".into()))
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

/// Fsync the parent directory so the rename survives a crash.
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
