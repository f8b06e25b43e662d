//! # Bloom Filter
//!
//! A space-efficient probabilistic set of stream hashes.
//!
//! The filter can say with certainty that a stream is **not** in a table
//! (no false negatives), but may occasionally claim that it is when it isn't
//! (false positives).
//!
//! ## Usage in the index
//!
//! Every immutable table may carry a sidecar file `<table>.bloomfilter` holding
//! a filter of the distinct stream hashes it contains. Lookups consult the
//! filter first and skip the table entirely on a negative answer. A missing or
//! damaged sidecar only costs performance, never correctness.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.insert(0xDEAD_BEEF);
//! assert!(bf.may_contain(0xDEAD_BEEF));
//! ```
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Extension appended to a table file name to form its sidecar name.
pub const SIDECAR_SUFFIX: &str = ".bloomfilter";

/// Magic bytes at the start of a serialized filter.
const BLOOM_MAGIC: &[u8; 4] = b"BLM1";

/// Serialized filters above this size are rejected as corrupt.
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// A bloom filter backed by a bit vector with `k` derived hash functions.
///
/// Uses double hashing: `h(i) = h1 + i * h2` where `h1` and `h2` are two
/// independent mixes of the 64-bit stream hash.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates a new bloom filter sized for `expected_items` with the given
    /// target `false_positive_rate`. Zero expected items is treated as one.
    ///
    /// # Panics
    ///
    /// Panics if `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        // m = -n * ln(p) / (ln(2)^2)
        let n = expected_items.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as u64;
        let m = m.max(64);

        // k = (m/n) * ln(2)
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.clamp(1, 30);

        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn insert(&mut self, stream_hash: u64) {
        let (h1, h2) = hash_pair(stream_hash);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// Returns `false` only if `stream_hash` was definitely never inserted.
    #[must_use]
    pub fn may_contain(&self, stream_hash: u64) -> bool {
        let (h1, h2) = hash_pair(stream_hash);
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            (self.bits[(idx / 8) as usize] >> (idx % 8)) & 1 == 1
        })
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serializes the filter.
    ///
    /// Wire format (all little-endian):
    /// ```text
    /// [magic "BLM1"][num_bits: u64][num_hashes: u32][bits_len: u32][bits][fnv1a(bits): u64]
    /// ```
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(BLOOM_MAGIC)?;
        w.write_all(&self.num_bits.to_le_bytes())?;
        w.write_all(&self.num_hashes.to_le_bytes())?;
        w.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        w.write_all(&self.bits)?;
        w.write_all(&fnv1a_64(&self.bits).to_le_bytes())?;
        Ok(())
    }

    /// Deserializes a filter written by [`write_to`](BloomFilter::write_to),
    /// rejecting anything inconsistent with `InvalidData`.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != BLOOM_MAGIC {
            return Err(invalid("bad bloom filter magic".to_string()));
        }

        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        r.read_exact(&mut buf8)?;
        let num_bits = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf4)?;
        let num_hashes = u32::from_le_bytes(buf4);
        r.read_exact(&mut buf4)?;
        let bits_len = u32::from_le_bytes(buf4) as usize;

        if bits_len > MAX_BLOOM_BYTES {
            return Err(invalid(format!("bloom filter too large: {} bytes", bits_len)));
        }
        if num_bits == 0 || num_hashes == 0 || (num_bits + 7) / 8 != bits_len as u64 {
            return Err(invalid(format!(
                "inconsistent bloom filter header: bits={} hashes={} len={}",
                num_bits, num_hashes, bits_len
            )));
        }

        let mut bits = vec![0u8; bits_len];
        r.read_exact(&mut bits)?;
        r.read_exact(&mut buf8)?;
        if u64::from_le_bytes(buf8) != fnv1a_64(&bits) {
            return Err(invalid("bloom filter checksum mismatch".to_string()));
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    /// Writes the filter to `path` via a temporary file and rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut w = BufWriter::new(file);
            self.write_to(&mut w)?;
            w.flush()?;
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&tmp, path)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("bytes", &self.bits.len())
            .finish()
    }
}

/// Path of the sidecar filter belonging to the table at `table_path`.
pub fn sidecar_path(table_path: &Path) -> PathBuf {
    let mut p = table_path.as_os_str().to_owned();
    p.push(SIDECAR_SUFFIX);
    PathBuf::from(p)
}

impl BloomFilter {
    /// h(i) = (h1 + i * h2) mod num_bits
    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

fn hash_pair(stream_hash: u64) -> (u64, u64) {
    let h1 = mix64(stream_hash ^ 0xcbf2_9ce4_8422_2325);
    // Odd step so successive probes never collapse onto one bit.
    let h2 = mix64(stream_hash ^ 0x517c_c1b7_2722_0a95) | 1;
    (h1, h2)
}

/// SplitMix64 finalizer.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn fnv1a_64(data: &[u8]) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests;
