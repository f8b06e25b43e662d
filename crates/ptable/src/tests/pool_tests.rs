use super::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn small_table(dir: &Path, max_readers: usize) -> Result<PTable> {
    let opts = TableOptions::default().readers(1, max_readers);
    write_table(dir, "pooled", &[(1, 0, 10), (1, 1, 11)], CURRENT_VERSION, &opts)
}

// -------------------- Leasing --------------------

#[test]
fn non_blocking_lease_fails_when_exhausted() -> Result<()> {
    let dir = tempdir()?;
    let t = small_table(dir.path(), 2)?;
    let a = t.lease_reader(LeaseMode::NonBlocking)?;
    let b = t.lease_reader(LeaseMode::NonBlocking)?;
    let err = t.lease_reader(LeaseMode::NonBlocking).unwrap_err();
    assert!(matches!(err, PTableError::ReaderExhausted { max: 2, .. }));

    drop(a);
    let _c = t.lease_reader(LeaseMode::NonBlocking)?;
    drop(b);
    Ok(())
}

#[test]
fn blocking_lease_waits_for_a_returned_reader() -> Result<()> {
    let dir = tempdir()?;
    let t = Arc::new(small_table(dir.path(), 1)?);
    let held = t.lease_reader(LeaseMode::NonBlocking)?;

    let t2 = Arc::clone(&t);
    let waiter = thread::spawn(move || t2.lookup_one(1, 1).map_err(|e| e.to_string()));

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    drop(held);

    let found = waiter.join().map_err(|_| anyhow::anyhow!("waiter panicked"))?;
    assert_eq!(found, Ok(Some(11)));
    Ok(())
}

// -------------------- Retirement --------------------

#[test]
fn retired_table_refuses_new_leases() -> Result<()> {
    let dir = tempdir()?;
    let t = small_table(dir.path(), 2)?;
    t.mark_for_destruction();
    assert!(t.is_retired());
    let err = t.lookup_one(1, 0).unwrap_err();
    assert!(matches!(err, PTableError::TableRetired(_)));
    Ok(())
}

#[test]
fn destruction_waits_for_outstanding_lease() -> Result<()> {
    let dir = tempdir()?;
    let t = small_table(dir.path(), 2)?;
    let path = t.path().to_path_buf();
    let sidecar = dir.path().join("pooled.bloomfilter");

    let range = t.lookup_range(1, 0, 1)?;
    let mut it = range.iter()?;
    t.mark_for_destruction();

    // The open iterator keeps the file alive and readable.
    assert!(path.exists());
    assert!(!t.is_destroyed());
    assert_eq!(it.next().transpose()?.map(|e| e.log_position), Some(10));
    assert_eq!(it.next().transpose()?.map(|e| e.log_position), Some(11));
    assert!(!t.wait_for_disposal(Duration::from_millis(10)));

    drop(it);
    assert!(t.wait_for_disposal(Duration::from_secs(1)));
    assert!(!path.exists());
    assert!(!sidecar.exists());
    Ok(())
}

#[test]
fn idle_table_is_deleted_immediately() -> Result<()> {
    let dir = tempdir()?;
    let t = small_table(dir.path(), 2)?;
    let path = t.path().to_path_buf();
    t.mark_for_destruction();
    assert!(t.is_destroyed());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn dispose_keeps_files() -> Result<()> {
    let dir = tempdir()?;
    let t = small_table(dir.path(), 2)?;
    let path = t.path().to_path_buf();
    t.dispose();
    assert!(t.wait_for_disposal(Duration::from_millis(100)));
    assert!(path.exists());
    assert!(PTable::open(&path, &TableOptions::default())?.lookup_one(1, 0)?.is_some());
    Ok(())
}

#[test]
fn blocked_leaser_wakes_up_on_retirement() -> Result<()> {
    let dir = tempdir()?;
    let t = Arc::new(small_table(dir.path(), 1)?);
    let held = t.lease_reader(LeaseMode::NonBlocking)?;

    let t2 = Arc::clone(&t);
    let waiter = thread::spawn(move || {
        matches!(t2.lease_reader(LeaseMode::Blocking), Err(PTableError::TableRetired(_)))
    });
    thread::sleep(Duration::from_millis(50));
    t.mark_for_destruction();

    let retired = waiter.join().map_err(|_| anyhow::anyhow!("waiter panicked"))?;
    assert!(retired);
    drop(held);
    assert!(t.is_destroyed());
    Ok(())
}
