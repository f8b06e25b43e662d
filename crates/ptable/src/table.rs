use bloom::BloomFilter;
use memtable::{IndexEntry, MemTable};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use crate::format::{
    check_version, decode_record, file_len_for, Trailer, CHECKED_TRAILER_PREFIX,
    PTABLE_VERSION_32BIT, RECORD_SIZE, TRAILER_SIZE,
};
use crate::pool::{LeaseMode, ReaderLease, ReaderPool};
use crate::writer::TableWriter;
use crate::{PTableError, Result, TableOptions};

/// A cached key and the record index it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midpoint {
    pub key: (u64, i64),
    pub index: u64,
}

/// An immutable, sorted, on-disk table of index entries.
///
/// Tables are shared between index snapshots behind an `Arc`. All reads go
/// through a leased file handle; see [`PTable::mark_for_destruction`] for
/// how a table that is no longer referenced by the live index gets deleted.
pub struct PTable {
    id: Uuid,
    path: PathBuf,
    version: u8,
    count: u64,
    checksum: u64,
    min_key: Option<(u64, i64)>,
    max_key: Option<(u64, i64)>,
    midpoints: Vec<Midpoint>,
    bloom: Option<BloomFilter>,
    pool: ReaderPool,
}

impl std::fmt::Debug for PTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PTable")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("count", &self.count)
            .field("midpoints", &self.midpoints.len())
            .field("bloom", &self.bloom.is_some())
            .finish()
    }
}

impl PTable {
    /// Opens an existing table file.
    ///
    /// The file length must match the trailer's entry count and the version
    /// must be known. Unless `opts.skip_verify` is set the whole-file checksum
    /// and key order are verified too. Any mismatch is [`PTableError::Corrupt`].
    pub fn open(path: &Path, opts: &TableOptions) -> Result<Self> {
        opts.check()?;
        let started = Instant::now();
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < TRAILER_SIZE {
            return Err(corrupt(path, format!("file too small ({} bytes)", len)));
        }

        file.seek(SeekFrom::Start(len - TRAILER_SIZE))?;
        let mut buf = [0u8; TRAILER_SIZE as usize];
        file.read_exact(&mut buf)?;
        let trailer = Trailer::decode(&buf);

        check_version(trailer.version).map_err(|_| {
            corrupt(path, format!("unknown format version {}", trailer.version))
        })?;
        if file_len_for(trailer.entry_count) != Some(len) {
            return Err(corrupt(
                path,
                format!(
                    "length {} does not match {} entries",
                    len, trailer.entry_count
                ),
            ));
        }
        drop(file);

        let sidecar = bloom::sidecar_path(path);
        let pool = ReaderPool::new(
            path,
            vec![sidecar.clone()],
            opts.initial_readers,
            opts.max_readers,
        )?;

        let mut table = Self {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            version: trailer.version,
            count: trailer.entry_count,
            checksum: trailer.checksum,
            min_key: None,
            max_key: None,
            midpoints: Vec::new(),
            bloom: None,
            pool,
        };

        if !opts.skip_verify {
            table.verify_integrity()?;
        }
        table.load_key_cache(opts.cache_depth)?;
        if opts.use_bloom_filter {
            table.bloom = load_bloom(&sidecar);
        }

        tracing::debug!(
            path = %table.path.display(),
            entries = table.count,
            version = table.version,
            midpoints = table.midpoints.len(),
            bloom = table.bloom.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "opened table"
        );
        Ok(table)
    }

    /// Writes the contents of `mem` as a new table at `path` and opens it.
    ///
    /// For a version-1 table each stream hash must fit in 32 bits.
    pub fn from_memtable(
        mem: &MemTable,
        path: &Path,
        version: u8,
        opts: &TableOptions,
    ) -> Result<Self> {
        opts.check()?;
        let started = Instant::now();
        let mut writer =
            TableWriter::create(path, version, mem.len() as u64, opts.use_bloom_filter)?;
        for entry in mem.iter() {
            if version == PTABLE_VERSION_32BIT && entry.stream_hash > u64::from(u32::MAX) {
                return Err(PTableError::InvalidArgument(format!(
                    "hash {:#x} does not fit a version {} table",
                    entry.stream_hash, version
                )));
            }
            writer.append(&entry)?;
        }
        let written = writer.finish()?;

        tracing::info!(
            path = %path.display(),
            entries = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dumped memtable to table"
        );
        Self::open(path, &opts.clone().skip_verify(true))
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without directory, as recorded in the manifest.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn midpoints(&self) -> &[Midpoint] {
        &self.midpoints
    }

    #[must_use]
    pub fn has_bloom_filter(&self) -> bool {
        self.bloom.is_some()
    }

    /// Borrows a reader from this table's pool.
    pub fn lease_reader(&self, mode: LeaseMode) -> Result<ReaderLease<'_>> {
        self.pool.lease(mode)
    }

    /// Recomputes the checksum over the whole file and checks key order.
    pub fn verify_integrity(&self) -> Result<()> {
        let mut reader = self.pool.lease(LeaseMode::Blocking)?;
        reader.seek(SeekFrom::Start(0))?;

        let mut hasher = Xxh3::new();
        let mut buf = [0u8; RECORD_SIZE as usize];
        let mut last: Option<(u64, i64)> = None;
        for i in 0..self.count {
            reader.read_exact(&mut buf)?;
            hasher.update(&buf);
            let key = decode_record(&buf).key();
            if let Some(prev) = last {
                if key <= prev {
                    return Err(corrupt(
                        &self.path,
                        format!("record {} key {:?} is not above {:?}", i, key, prev),
                    ));
                }
            }
            last = Some(key);
        }

        let mut trailer = [0u8; TRAILER_SIZE as usize];
        reader.read_exact(&mut trailer)?;
        hasher.update(&trailer[..CHECKED_TRAILER_PREFIX]);
        let actual = hasher.digest();
        if actual != self.checksum {
            return Err(corrupt(
                &self.path,
                format!(
                    "checksum mismatch: stored {:#018x}, computed {:#018x}",
                    self.checksum, actual
                ),
            ));
        }
        Ok(())
    }

    /// Position of event `event_number` of the stream, if present.
    pub fn lookup_one(&self, stream_hash: u64, event_number: i64) -> Result<Option<i64>> {
        let hash = self.table_hash(stream_hash);
        let key = (hash, event_number);
        if !self.may_contain(hash) || !self.key_in_span(key, key) {
            return Ok(None);
        }
        let mut reader = self.pool.lease(LeaseMode::Blocking)?;
        let idx = self.partition(&mut reader, |k| k < key)?;
        if idx >= self.count {
            return Ok(None);
        }
        let e = read_at(&mut reader, idx)?;
        Ok((e.key() == key).then_some(e.log_position))
    }

    /// The highest-numbered event of the stream held by this table.
    pub fn latest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        let hash = self.table_hash(stream_hash);
        if !self.may_contain(hash) || !self.key_in_span((hash, i64::MIN), (hash, i64::MAX)) {
            return Ok(None);
        }
        let mut reader = self.pool.lease(LeaseMode::Blocking)?;
        let end = self.partition(&mut reader, |k| k.0 <= hash)?;
        if end == 0 {
            return Ok(None);
        }
        let e = read_at(&mut reader, end - 1)?;
        Ok((e.stream_hash == hash).then_some(e))
    }

    /// Entries of the stream numbered within `[from, to]`.
    ///
    /// The returned range is lazy and restartable: every call to
    /// [`EntryRange::iter`] or [`EntryRange::iter_rev`] re-reads from disk.
    pub fn lookup_range(&self, stream_hash: u64, from: i64, to: i64) -> Result<EntryRange<'_>> {
        let hash = self.table_hash(stream_hash);
        let empty = EntryRange {
            table: self,
            lo: 0,
            hi: 0,
        };
        if from > to || !self.may_contain(hash) || !self.key_in_span((hash, from), (hash, to)) {
            return Ok(empty);
        }
        let mut reader = self.pool.lease(LeaseMode::Blocking)?;
        let lo = self.partition(&mut reader, |k| k < (hash, from))?;
        let hi = self.partition(&mut reader, |k| k <= (hash, to))?;
        Ok(EntryRange {
            table: self,
            lo,
            hi: hi.max(lo),
        })
    }

    /// Every entry in ascending key order.
    pub fn iter_all(&self) -> Result<RangeIter<'_>> {
        EntryRange {
            table: self,
            lo: 0,
            hi: self.count,
        }
        .iter()
    }

    /// Retires the table: no new leases are granted, and the file and its
    /// sidecar are deleted once the last outstanding lease is released.
    pub fn mark_for_destruction(&self) {
        tracing::debug!(path = %self.path.display(), "table marked for destruction");
        self.pool.mark_for_destruction();
    }

    /// Retires the table without deleting its files.
    pub fn dispose(&self) {
        self.pool.dispose();
    }

    /// Waits for a retired table to release every reader.
    pub fn wait_for_disposal(&self, timeout: Duration) -> bool {
        self.pool.wait_for_disposal(timeout)
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.pool.is_retired()
    }

    /// True once a retired table has closed its readers (and deleted its files
    /// if it was marked for destruction).
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.pool.is_destroyed()
    }

    #[must_use]
    pub fn leased_readers(&self) -> usize {
        self.pool.leased_count()
    }

    // ---- Internal helpers ----

    /// Version-1 tables store only the high half of the 64-bit hash.
    fn table_hash(&self, stream_hash: u64) -> u64 {
        if self.version == PTABLE_VERSION_32BIT {
            stream_hash >> 32
        } else {
            stream_hash
        }
    }

    fn may_contain(&self, hash: u64) -> bool {
        self.bloom.as_ref().map_or(true, |b| b.may_contain(hash))
    }

    /// Whether `[lo, hi]` can overlap the keys stored in this table.
    fn key_in_span(&self, lo: (u64, i64), hi: (u64, i64)) -> bool {
        match (self.min_key, self.max_key) {
            (Some(min), Some(max)) => hi >= min && lo <= max,
            _ => false,
        }
    }

    /// First record index whose key fails `pred`. `pred` must be monotone:
    /// true for a prefix of the table, false afterwards.
    fn partition<F>(&self, reader: &mut BufReader<File>, pred: F) -> Result<u64>
    where
        F: Fn((u64, i64)) -> bool,
    {
        let (mut lo, mut hi) = (0u64, self.count);
        if !self.midpoints.is_empty() {
            let p = self.midpoints.partition_point(|m| pred(m.key));
            if p == 0 {
                return Ok(self.midpoints[0].index);
            }
            if p == self.midpoints.len() {
                return Ok(self.count);
            }
            lo = self.midpoints[p - 1].index + 1;
            hi = self.midpoints[p].index;
        }
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(read_at(reader, mid)?.key()) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn load_key_cache(&mut self, depth: u32) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        let mut reader = self.pool.lease(LeaseMode::Blocking)?;
        let first = read_at(&mut reader, 0)?.key();
        let last = read_at(&mut reader, self.count - 1)?.key();

        let mut midpoints = Vec::new();
        if depth > 0 && self.count >= 2 {
            let wanted = (1u64 << depth).min(self.count).max(2);
            midpoints.reserve(wanted as usize);
            for i in 0..wanted {
                let index = (self.count - 1) * i / (wanted - 1);
                let key = read_at(&mut reader, index)?.key();
                midpoints.push(Midpoint { key, index });
            }
            if midpoints.windows(2).any(|w| w[0].key > w[1].key) {
                return Err(corrupt(&self.path, "keys are not sorted".to_string()));
            }
        }
        drop(reader);

        self.min_key = Some(first);
        self.max_key = Some(last);
        self.midpoints = midpoints;
        Ok(())
    }
}

/// Record indices `[lo, hi)` of one table that matched a range lookup.
#[derive(Debug, Clone, Copy)]
pub struct EntryRange<'a> {
    table: &'a PTable,
    lo: u64,
    hi: u64,
}

impl<'a> EntryRange<'a> {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.hi - self.lo
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hi == self.lo
    }

    /// Iterates the range in ascending event order.
    pub fn iter(&self) -> Result<RangeIter<'a>> {
        self.open(false)
    }

    /// Iterates the range in descending event order.
    pub fn iter_rev(&self) -> Result<RangeIter<'a>> {
        self.open(true)
    }

    /// Reads the whole range into memory.
    pub fn to_vec(&self) -> Result<Vec<IndexEntry>> {
        self.iter()?.collect()
    }

    fn open(&self, backward: bool) -> Result<RangeIter<'a>> {
        let reader = if self.is_empty() {
            None
        } else {
            let mut lease = self.table.pool.lease(LeaseMode::Blocking)?;
            if !backward {
                lease.seek(SeekFrom::Start(self.lo * RECORD_SIZE))?;
            }
            Some(lease)
        };
        Ok(RangeIter {
            reader,
            next: self.lo,
            end: self.hi,
            backward,
        })
    }
}

/// Iterator over an [`EntryRange`]. Holds a reader lease until dropped.
#[derive(Debug)]
pub struct RangeIter<'a> {
    reader: Option<ReaderLease<'a>>,
    /// Remaining records are `[next, end)`.
    next: u64,
    end: u64,
    backward: bool,
}

impl Iterator for RangeIter<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            self.reader = None;
            return None;
        }
        let reader = self.reader.as_mut()?;
        let item = if self.backward {
            self.end -= 1;
            read_at(reader, self.end)
        } else {
            self.next += 1;
            read_next(reader)
        };
        if item.is_err() {
            self.next = self.end;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.end - self.next) as usize;
        (n, Some(n))
    }
}

fn read_at(reader: &mut BufReader<File>, index: u64) -> Result<IndexEntry> {
    reader.seek(SeekFrom::Start(index * RECORD_SIZE))?;
    read_next(reader)
}

fn read_next(reader: &mut BufReader<File>) -> Result<IndexEntry> {
    let mut buf = [0u8; RECORD_SIZE as usize];
    reader.read_exact(&mut buf)?;
    Ok(decode_record(&buf))
}

fn load_bloom(sidecar: &Path) -> Option<BloomFilter> {
    match BloomFilter::load(sidecar) {
        Ok(b) => Some(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %sidecar.display(), "no bloom filter for table");
            None
        }
        Err(e) => {
            tracing::warn!(path = %sidecar.display(), error = %e, "ignoring unreadable bloom filter");
            None
        }
    }
}

fn corrupt(path: &Path, reason: String) -> PTableError {
    PTableError::Corrupt(format!("{}: {}", path.display(), reason))
}
