use super::*;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

fn stream_table(dir: &Path, opts: &TableOptions) -> Result<PTable> {
    // Three streams, interleaved hashes, ten events each.
    let mut entries = Vec::new();
    for hash in [10u64, 20, 30] {
        for n in 0..10i64 {
            entries.push((hash, n, hash as i64 * 1000 + n));
        }
    }
    write_table(dir, "streams", &entries, CURRENT_VERSION, opts)
}

// -------------------- Point lookups --------------------

#[test]
fn lookup_one_finds_every_entry() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    for hash in [10u64, 20, 30] {
        for n in 0..10 {
            assert_eq!(t.lookup_one(hash, n)?, Some(hash as i64 * 1000 + n));
        }
    }
    Ok(())
}

#[test]
fn lookup_one_misses() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    assert_eq!(t.lookup_one(10, 10)?, None);
    assert_eq!(t.lookup_one(10, -1)?, None);
    assert_eq!(t.lookup_one(15, 0)?, None);
    assert_eq!(t.lookup_one(0, 0)?, None);
    assert_eq!(t.lookup_one(u64::MAX, 0)?, None);
    Ok(())
}

#[test]
fn lookups_agree_with_and_without_midpoints() -> Result<()> {
    let dir = tempdir()?;
    let mut entries = Vec::new();
    for i in 0..500u64 {
        entries.push((i * 7 % 97, (i / 97) as i64, i as i64));
    }
    entries.sort();
    entries.dedup_by_key(|e| (e.0, e.1));

    let cached = write_table(dir.path(), "a", &entries, CURRENT_VERSION, &TableOptions::default())?;
    let plain = PTable::open(cached.path(), &TableOptions::default().cache_depth(0))?;
    assert!(!cached.midpoints().is_empty());
    assert!(plain.midpoints().is_empty());

    for hash in 0..100u64 {
        for n in -1..7i64 {
            assert_eq!(cached.lookup_one(hash, n)?, plain.lookup_one(hash, n)?);
        }
        assert_eq!(cached.latest_entry(hash)?, plain.latest_entry(hash)?);
    }
    Ok(())
}

#[test]
fn midpoints_cover_first_and_last_record() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default().cache_depth(2))?;
    let mids = t.midpoints();
    assert_eq!(mids.len(), 4);
    assert_eq!(mids[0].index, 0);
    assert_eq!(mids[0].key, (10, 0));
    assert_eq!(mids[3].index, t.count() - 1);
    assert_eq!(mids[3].key, (30, 9));
    Ok(())
}

#[test]
fn oversized_cache_depth_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    for depth in [MAX_CACHE_DEPTH + 1, 64, u32::MAX] {
        let err = PTable::open(t.path(), &TableOptions::default().cache_depth(depth)).unwrap_err();
        assert!(matches!(err, PTableError::InvalidArgument(_)));
    }

    let err = stream_table(dir.path(), &TableOptions::default().cache_depth(64)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PTableError>(),
        Some(PTableError::InvalidArgument(_))
    ));

    let deepest = PTable::open(t.path(), &TableOptions::default().cache_depth(MAX_CACHE_DEPTH))?;
    assert_eq!(deepest.midpoints().len() as u64, deepest.count());
    Ok(())
}

#[test]
fn latest_entry_returns_highest_number() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    assert_eq!(t.latest_entry(20)?, Some(IndexEntry::new(20, 9, 20_009)));
    assert_eq!(t.latest_entry(25)?, None);
    assert_eq!(t.latest_entry(31)?, None);
    Ok(())
}

// -------------------- Range lookups --------------------

#[test]
fn range_forward_and_backward() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let range = t.lookup_range(20, 3, 6)?;
    assert_eq!(range.len(), 4);

    let forward: Vec<i64> = range.iter()?.map(|e| e.map(|e| e.event_number)).collect::<crate::Result<_>>()?;
    assert_eq!(forward, vec![3, 4, 5, 6]);

    let backward: Vec<i64> =
        range.iter_rev()?.map(|e| e.map(|e| e.event_number)).collect::<crate::Result<_>>()?;
    assert_eq!(backward, vec![6, 5, 4, 3]);
    Ok(())
}

#[test]
fn range_is_restartable() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let range = t.lookup_range(30, 0, 100)?;
    let first = range.to_vec()?;
    let second = range.to_vec()?;
    assert_eq!(first.len(), 10);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn range_edge_cases_are_empty() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    assert!(t.lookup_range(20, 6, 3)?.is_empty());
    assert!(t.lookup_range(20, 10, 20)?.is_empty());
    assert!(t.lookup_range(21, 0, 9)?.is_empty());
    assert_eq!(t.lookup_range(10, i64::MIN, i64::MAX)?.len(), 10);
    Ok(())
}

#[test]
fn iterator_releases_lease_when_dropped() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let range = t.lookup_range(10, 0, 9)?;
    let mut it = range.iter()?;
    assert!(it.next().is_some());
    assert_eq!(t.leased_readers(), 1);
    drop(it);
    assert_eq!(t.leased_readers(), 0);
    Ok(())
}

// -------------------- 32-bit tables --------------------

#[test]
fn version_one_lookups_use_high_half_of_hash() -> Result<()> {
    let dir = tempdir()?;
    let t = write_table(
        dir.path(),
        "v1",
        &[(0x1234, 0, 7), (0x1234, 1, 8)],
        PTABLE_VERSION_32BIT,
        &TableOptions::default(),
    )?;
    let wide = (0x1234u64 << 32) | 0xFFFF;
    assert_eq!(t.lookup_one(wide, 1)?, Some(8));
    assert_eq!(t.latest_entry(wide)?.map(|e| e.log_position), Some(8));
    Ok(())
}

// -------------------- Bloom filter --------------------

#[test]
fn missing_sidecar_is_tolerated() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let path = t.path().to_path_buf();
    drop(t);
    fs::remove_file(dir.path().join("streams.bloomfilter"))?;

    let t = PTable::open(&path, &TableOptions::default())?;
    assert!(!t.has_bloom_filter());
    assert_eq!(t.lookup_one(20, 4)?, Some(20_004));
    Ok(())
}

#[test]
fn corrupt_sidecar_is_tolerated() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let path = t.path().to_path_buf();
    drop(t);
    fs::write(dir.path().join("streams.bloomfilter"), b"garbage")?;

    let t = PTable::open(&path, &TableOptions::default())?;
    assert!(!t.has_bloom_filter());
    assert_eq!(t.lookup_one(30, 9)?, Some(30_009));
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn truncated_file_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let path = t.path().to_path_buf();
    drop(t);
    let len = fs::metadata(&path)?.len();
    OpenOptions::new().write(true).open(&path)?.set_len(len - 5)?;

    let err = PTable::open(&path, &TableOptions::default().skip_verify(true)).unwrap_err();
    assert!(matches!(err, PTableError::Corrupt(_)), "{}", err);
    Ok(())
}

#[test]
fn tiny_file_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tiny");
    fs::write(&path, [1u8, 2, 3])?;
    let err = PTable::open(&path, &TableOptions::default()).unwrap_err();
    assert!(matches!(err, PTableError::Corrupt(_)));
    Ok(())
}

#[test]
fn unknown_version_byte_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let path = t.path().to_path_buf();
    drop(t);
    let len = fs::metadata(&path)?.len();
    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.seek(SeekFrom::Start(len - TRAILER_SIZE + 8))?;
    f.write_all(&[99])?;
    drop(f);

    let err = PTable::open(&path, &TableOptions::default().skip_verify(true)).unwrap_err();
    assert!(matches!(err, PTableError::Corrupt(_)));
    Ok(())
}

#[test]
fn flipped_record_byte_fails_verification_only_when_verifying() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    let path = t.path().to_path_buf();
    drop(t);
    // Change a log position: ordering stays valid, checksum does not.
    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.seek(SeekFrom::Start(RECORD_SIZE * 5 + 16))?;
    f.write_all(&[0xEE])?;
    drop(f);

    let err = PTable::open(&path, &TableOptions::default()).unwrap_err();
    assert!(matches!(err, PTableError::Corrupt(ref m) if m.contains("checksum")), "{}", err);

    let t = PTable::open(&path, &TableOptions::default().skip_verify(true))?;
    assert!(t.verify_integrity().is_err());
    Ok(())
}

#[test]
fn verify_integrity_passes_on_clean_table() -> Result<()> {
    let dir = tempdir()?;
    let t = stream_table(dir.path(), &TableOptions::default())?;
    t.verify_integrity()?;
    Ok(())
}
