//! Bounded pool of file readers with deferred destruction.
//!
//! Every read against a table borrows a [`ReaderLease`]. When the lease is
//! dropped the handle goes back to the pool. Once a table is retired (by
//! [`ReaderPool::mark_for_destruction`] or [`ReaderPool::dispose`]) no new
//! leases are granted, and the last returned lease closes the remaining
//! handles. For a table marked for destruction that is also the moment its
//! files are deleted, never earlier.

use parking_lot::{Condvar, Mutex};
use std::fs::{self, File};
use std::io::BufReader;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{PTableError, Result};

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// How [`ReaderPool::lease`] behaves when every reader is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Wait until a reader is returned or the table is retired.
    Blocking,
    /// Fail immediately with [`PTableError::ReaderExhausted`].
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    Keep,
    Delete,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<BufReader<File>>,
    /// Handles currently open, idle or leased.
    open: usize,
    leased: usize,
    retired: Option<Retirement>,
    destroyed: bool,
}

pub(crate) struct ReaderPool {
    path: PathBuf,
    /// Files removed together with the table (bloom sidecar).
    companions: Vec<PathBuf>,
    max_readers: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
    disposed: Condvar,
}

impl ReaderPool {
    /// Opens `initial` handles eagerly; up to `max` are opened on demand.
    pub(crate) fn new(
        path: &Path,
        companions: Vec<PathBuf>,
        initial: usize,
        max: usize,
    ) -> Result<Self> {
        let max = max.max(1);
        let initial = initial.clamp(1, max);
        let mut idle = Vec::with_capacity(initial);
        for _ in 0..initial {
            idle.push(open_handle(path)?);
        }
        Ok(Self {
            path: path.to_path_buf(),
            companions,
            max_readers: max,
            state: Mutex::new(PoolState {
                open: idle.len(),
                idle,
                ..PoolState::default()
            }),
            returned: Condvar::new(),
            disposed: Condvar::new(),
        })
    }

    pub(crate) fn lease(&self, mode: LeaseMode) -> Result<ReaderLease<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.retired.is_some() {
                return Err(PTableError::TableRetired(self.path.clone()));
            }
            if let Some(reader) = state.idle.pop() {
                state.leased += 1;
                return Ok(ReaderLease {
                    pool: self,
                    reader: Some(reader),
                });
            }
            if state.open < self.max_readers {
                // Reserve the slot, then open outside the lock.
                state.open += 1;
                state.leased += 1;
                drop(state);
                return match open_handle(&self.path) {
                    Ok(reader) => Ok(ReaderLease {
                        pool: self,
                        reader: Some(reader),
                    }),
                    Err(e) => {
                        let mut state = self.state.lock();
                        state.open -= 1;
                        state.leased -= 1;
                        self.finish_if_drained(&mut state);
                        Err(e)
                    }
                };
            }
            match mode {
                LeaseMode::NonBlocking => {
                    return Err(PTableError::ReaderExhausted {
                        path: self.path.clone(),
                        max: self.max_readers,
                    })
                }
                LeaseMode::Blocking => self.returned.wait(&mut state),
            }
        }
    }

    fn release(&self, reader: BufReader<File>) {
        let mut state = self.state.lock();
        state.leased -= 1;
        if state.retired.is_some() {
            state.open -= 1;
            drop(reader);
            self.finish_if_drained(&mut state);
        } else {
            state.idle.push(reader);
            self.returned.notify_one();
        }
    }

    /// Retires the pool and deletes the table files once the last lease is back.
    pub(crate) fn mark_for_destruction(&self) {
        self.retire(Retirement::Delete);
    }

    /// Retires the pool without deleting anything.
    pub(crate) fn dispose(&self) {
        self.retire(Retirement::Keep);
    }

    fn retire(&self, how: Retirement) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.retired = match (state.retired, how) {
            (Some(Retirement::Delete), _) | (_, Retirement::Delete) => Some(Retirement::Delete),
            _ => Some(Retirement::Keep),
        };
        state.open -= state.idle.len();
        state.idle.clear();
        self.finish_if_drained(&mut state);
        // Blocked leasers must observe the retirement.
        self.returned.notify_all();
    }

    fn finish_if_drained(&self, state: &mut PoolState) {
        if state.destroyed || state.leased > 0 {
            return;
        }
        let Some(how) = state.retired else { return };
        state.destroyed = true;
        if how == Retirement::Delete {
            for p in std::iter::once(&self.path).chain(self.companions.iter()) {
                match fs::remove_file(p) {
                    Ok(()) => tracing::debug!(path = %p.display(), "deleted retired table file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::error!(path = %p.display(), error = %e, "failed to delete retired table file")
                    }
                }
            }
        }
        self.disposed.notify_all();
    }

    /// Waits until the pool has been retired and every lease returned.
    /// Returns `false` if `timeout` elapsed first.
    pub(crate) fn wait_for_disposal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.destroyed {
            if self.disposed.wait_until(&mut state, deadline).timed_out() {
                return state.destroyed;
            }
        }
        true
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state.lock().retired.is_some()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn leased_count(&self) -> usize {
        self.state.lock().leased
    }
}

fn open_handle(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::with_capacity(READ_BUFFER_BYTES, File::open(path)?))
}

/// A reader borrowed from a table's pool; returned on drop.
pub struct ReaderLease<'a> {
    pool: &'a ReaderPool,
    reader: Option<BufReader<File>>,
}

impl Deref for ReaderLease<'_> {
    type Target = BufReader<File>;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the reader out.
        self.reader.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for ReaderLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.reader.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ReaderLease<'_> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.release(reader);
        }
    }
}

impl std::fmt::Debug for ReaderLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderLease")
            .field("path", &self.pool.path)
            .finish()
    }
}
