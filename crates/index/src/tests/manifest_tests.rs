use super::*;
use tempfile::tempdir;

fn sample() -> Manifest {
    Manifest {
        prepare_checkpoint: 5120,
        commit_checkpoint: 5040,
        max_auto_merge_level: 2,
        tables: vec![
            ManifestTable {
                level: 0,
                file_name: "table-000003".into(),
                entry_count: 10,
            },
            ManifestTable {
                level: 1,
                file_name: "table-000002".into(),
                entry_count: 20,
            },
        ],
    }
}

/// Re-renders `body` with a correct checksum line.
fn with_checksum(body: &str) -> String {
    format!("{:08X}\n{}", crc32fast::hash(body.as_bytes()), body)
}

#[test]
fn render_then_parse_restores_manifest() -> Result<()> {
    let m = sample();
    let text = m.render();
    assert_eq!(text.lines().nth(1), Some("2"));
    assert_eq!(text.lines().nth(2), Some("5120/5040"));
    assert_eq!(text.lines().nth(4), Some("0;table-000003;10"));
    assert_eq!(Manifest::parse(&text)?, m);
    Ok(())
}

#[test]
fn save_and_load() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    sample().save(&path)?;
    assert_eq!(Manifest::load(&path)?, Some(sample()));
    // Temp files are renamed away.
    assert_eq!(files_in(dir.path())?, vec![MANIFEST_FILENAME.to_string()]);
    Ok(())
}

#[test]
fn save_overwrites_previous_manifest() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    sample().save(&path)?;
    let mut next = sample();
    next.tables.pop();
    next.commit_checkpoint = 6000;
    next.save(&path)?;
    assert_eq!(Manifest::load(&path)?, Some(next));
    Ok(())
}

#[test]
fn missing_manifest_is_none() -> Result<()> {
    let dir = tempdir()?;
    assert_eq!(Manifest::load(&dir.path().join(MANIFEST_FILENAME))?, None);
    Ok(())
}

#[test]
fn empty_manifest_round_trips() -> Result<()> {
    let m = Manifest {
        prepare_checkpoint: -1,
        commit_checkpoint: -1,
        max_auto_merge_level: 0,
        tables: vec![],
    };
    assert_eq!(Manifest::parse(&m.render())?, m);
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn flipped_byte_fails_checksum() {
    let text = sample().render().replace("5040", "5041");
    assert!(Manifest::parse(&text).unwrap_err().is_corrupt());
}

#[test]
fn unknown_version_is_corrupt() {
    let text = with_checksum("3\n0/0\n2\n");
    assert!(Manifest::parse(&text).unwrap_err().is_corrupt());
}

#[test]
fn malformed_lines_are_corrupt() {
    for body in [
        "2\n0-0\n2\n",
        "2\n0/0\n",
        "2\n0/0\nx\n",
        "2\n0/0\n2\n0;a\n",
        "2\n0/0\n2\n0;a;1;extra\n",
        "2\n0/0\n2\nz;a;1\n",
        "2\n0/0\n2\n0;;1\n",
        "2\n0/0\n2\n0;../a;1\n",
        "2\n-2/0\n2\n",
    ] {
        let err = Manifest::parse(&with_checksum(body)).unwrap_err();
        assert!(err.is_corrupt(), "{:?} should be corrupt", body);
    }
}

#[test]
fn levels_must_not_decrease() {
    let text = with_checksum("2\n5/5\n2\n1;a;1\n0;b;1\n");
    assert!(Manifest::parse(&text).unwrap_err().is_corrupt());
}

#[test]
fn tables_need_real_checkpoints() {
    let text = with_checksum("2\n-1/-1\n2\n0;a;1\n");
    assert!(Manifest::parse(&text).unwrap_err().is_corrupt());
}

#[test]
fn garbage_file_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(MANIFEST_FILENAME);
    std::fs::write(&path, b"not a manifest")?;
    let err = Manifest::load(&path).unwrap_err();
    assert!(err.is_corrupt());
    assert!(err.to_string().contains(MANIFEST_FILENAME));
    Ok(())
}
