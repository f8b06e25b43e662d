//! Stream name hashing.
//!
//! A 64-bit index hash is two independent 32-bit hashes glued together:
//! `high << 32 | low`. Version-1 tables stored only the high half, which
//! is what makes the upgrade `old << 32 | low(name)` land on exactly the
//! hash a fresh version-2 entry would get.

use ptable::{HashUpgrade, PTABLE_VERSION_32BIT};
use xxhash_rust::xxh32::xxh32;

const HIGH_SEED: u32 = 0x9747_b28c;
const LOW_SEED: u32 = 0x2f5a_11d3;

/// A 32-bit hash of a stream name.
pub trait StreamHasher: Send + Sync {
    fn hash(&self, stream: &str) -> u32;
}

/// XXH32 with a fixed seed.
#[derive(Debug, Clone, Copy)]
pub struct XxHasher {
    seed: u32,
}

impl XxHasher {
    pub const fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl StreamHasher for XxHasher {
    fn hash(&self, stream: &str) -> u32 {
        xxh32(stream.as_bytes(), self.seed)
    }
}

/// Produces index hashes for a given table version.
pub struct IndexHasher {
    high: Box<dyn StreamHasher>,
    low: Box<dyn StreamHasher>,
}

impl Default for IndexHasher {
    fn default() -> Self {
        Self::new(
            Box::new(XxHasher::with_seed(HIGH_SEED)),
            Box::new(XxHasher::with_seed(LOW_SEED)),
        )
    }
}

impl std::fmt::Debug for IndexHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHasher").finish_non_exhaustive()
    }
}

impl IndexHasher {
    pub fn new(high: Box<dyn StreamHasher>, low: Box<dyn StreamHasher>) -> Self {
        Self { high, low }
    }

    /// Full 64-bit hash of `stream`.
    #[must_use]
    pub fn hash(&self, stream: &str) -> u64 {
        (u64::from(self.high.hash(stream)) << 32) | u64::from(self.low.hash(stream))
    }

    /// Hash of `stream` as stored in a table of `version`.
    #[must_use]
    pub fn hash_for_version(&self, stream: &str, version: u8) -> u64 {
        if version == PTABLE_VERSION_32BIT {
            u64::from(self.high.hash(stream))
        } else {
            self.hash(stream)
        }
    }

    /// Whether `stored`, a hash found in some table, can belong to `stream`.
    #[must_use]
    pub fn matches(&self, stream: &str, stored: u64) -> bool {
        let full = self.hash(stream);
        stored == full || stored == full >> 32
    }
}

impl HashUpgrade for IndexHasher {
    fn upgrade_hash(&self, stream_name: &str, old_hash: u64) -> u64 {
        (old_hash << 32) | u64::from(self.low.hash(stream_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgraded_hash_equals_fresh_hash() {
        let h = IndexHasher::default();
        for name in ["orders-1", "$all", "user/42", ""] {
            let old = h.hash_for_version(name, PTABLE_VERSION_32BIT);
            assert!(old <= u64::from(u32::MAX));
            assert_eq!(h.upgrade_hash(name, old), h.hash(name));
        }
    }

    #[test]
    fn matches_both_widths() {
        let h = IndexHasher::default();
        let full = h.hash("stream-a");
        assert!(h.matches("stream-a", full));
        assert!(h.matches("stream-a", full >> 32));
        assert!(!h.matches("stream-b", full));
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = IndexHasher::default();
        let b = IndexHasher::default();
        assert_eq!(a.hash("x"), b.hash("x"));
        assert_ne!(a.hash("x"), a.hash("y"));
    }
}
