use super::*;
use std::io::Cursor;

// -------------------- Construction --------------------

#[test]
fn new_creates_valid_filter() {
    let bf = BloomFilter::new(100, 0.01);
    assert!(bf.num_bits() >= 64);
    assert!(bf.num_hashes() > 0);
    assert_eq!(bf.bits.len() as u64, (bf.num_bits() + 7) / 8);
}

#[test]
fn zero_expected_items_still_builds() {
    let mut bf = BloomFilter::new(0, 0.01);
    bf.insert(42);
    assert!(bf.may_contain(42));
}

#[test]
#[should_panic(expected = "false_positive_rate must be in (0, 1)")]
fn new_panics_on_one_fpr() {
    BloomFilter::new(100, 1.0);
}

// -------------------- Insert / Contains --------------------

#[test]
fn inserted_hash_is_found() {
    let mut bf = BloomFilter::new(100, 0.01);
    bf.insert(0xABCD);
    assert!(bf.may_contain(0xABCD));
}

#[test]
fn empty_filter_contains_nothing() {
    let bf = BloomFilter::new(100, 0.01);
    for h in [0u64, 1, 0xABCD, u64::MAX] {
        assert!(!bf.may_contain(h));
    }
}

#[test]
fn no_false_negatives() {
    let mut bf = BloomFilter::new(5000, 0.01);
    for i in 0..5000u64 {
        bf.insert(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    }
    for i in 0..5000u64 {
        assert!(bf.may_contain(i.wrapping_mul(0x9E37_79B9_7F4A_7C15)), "hash {} lost", i);
    }
}

#[test]
fn false_positive_rate_is_reasonable() {
    let n = 10_000u64;
    let mut bf = BloomFilter::new(n as usize, 0.01);
    for i in 0..n {
        bf.insert(i);
    }
    let false_positives = (n..2 * n).filter(|&i| bf.may_contain(i)).count();
    // 1% target; allow generous slack.
    assert!(false_positives < 300, "too many false positives: {}", false_positives);
}

// -------------------- Serialization --------------------

#[test]
fn write_then_read_preserves_membership() -> std::io::Result<()> {
    let mut bf = BloomFilter::new(200, 0.01);
    for i in 0..200u64 {
        bf.insert(i << 20);
    }
    let mut buf = Vec::new();
    bf.write_to(&mut buf)?;

    let restored = BloomFilter::read_from(&mut Cursor::new(buf))?;
    assert_eq!(restored, bf);
    Ok(())
}

#[test]
fn read_rejects_bad_magic() {
    let mut buf = Vec::new();
    BloomFilter::new(10, 0.01).write_to(&mut buf).unwrap();
    buf[0] = b'X';
    let err = BloomFilter::read_from(&mut Cursor::new(buf)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn read_rejects_flipped_bit() {
    let mut bf = BloomFilter::new(10, 0.01);
    bf.insert(7);
    let mut buf = Vec::new();
    bf.write_to(&mut buf).unwrap();
    // First byte of the bit vector follows the 20-byte header.
    buf[20] ^= 0xFF;
    let err = BloomFilter::read_from(&mut Cursor::new(buf)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn read_rejects_truncated_input() {
    let mut buf = Vec::new();
    BloomFilter::new(10, 0.01).write_to(&mut buf).unwrap();
    buf.truncate(buf.len() - 3);
    assert!(BloomFilter::read_from(&mut Cursor::new(buf)).is_err());
}

// -------------------- Sidecar files --------------------

#[test]
fn sidecar_path_appends_suffix() {
    let p = sidecar_path(Path::new("/data/index/abc"));
    assert_eq!(p, PathBuf::from("/data/index/abc.bloomfilter"));
}

#[test]
fn save_and_load_sidecar() -> std::io::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = sidecar_path(&dir.path().join("table"));

    let mut bf = BloomFilter::new(50, 0.01);
    bf.insert(99);
    bf.save(&path)?;

    let loaded = BloomFilter::load(&path)?;
    assert!(loaded.may_contain(99));
    assert!(!dir.path().join("table.bloomfilter.tmp").exists());
    Ok(())
}
