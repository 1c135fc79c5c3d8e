//! Serializes renumbering, repairs, and article create/delete.
//!
//! Callers in one process share a global mutex; separate processes working on
//! the same database meet on an exclusive lock of the store's lock file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::error::{RenumberError, RunPhase, RunProgress};
use crate::store::ContentStore;

static RUN_LOCK: Mutex<()> = Mutex::new(());

/// Held for the duration of a run. Releases the file lock before the mutex.
pub struct RunGuard {
    _file: Option<LockFile>,
    _process: MutexGuard<'static, ()>,
}

/// Blocks until both the process lock and the store's lock file are held.
///
/// A poisoned mutex is taken over: the guarded state lives in the store, and
/// every holder re-inspects the store before acting.
pub fn run_lock(store: &dyn ContentStore) -> Result<RunGuard> {
    let process = RUN_LOCK.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("run lock was poisoned by a panicked holder; continuing");
        poisoned.into_inner()
    });
    let file = store
        .lock_path()
        .map(|path| LockFile::acquire(&path))
        .transpose()?;
    Ok(RunGuard {
        _file: file,
        _process: process,
    })
}

pub(crate) fn lock_for_run(store: &dyn ContentStore) -> Result<RunGuard, RenumberError> {
    run_lock(store).map_err(|error| {
        RenumberError::persistence(RunPhase::Lock, None, RunProgress::default(), error)
    })
}

/// An exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(lock) = Self::try_acquire(path)? {
            return Ok(lock);
        }
        tracing::info!(
            path = %path.display(),
            "another blogtool process holds the run lock; waiting"
        );
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// `None` when someone else holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(error) if is_contended(&error) => Ok(None),
            Err(error) => Err(error).with_context(|| format!("failed to lock {}", path.display())),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), %error, "failed to release run lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == fs2::lock_contended_error().kind()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{LockFile, run_lock};
    use crate::store::{ContentStore, SqliteStore};

    #[test]
    fn stores_on_one_database_share_the_lock_file() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("blog.db");
        let first = SqliteStore::open(&db_path).expect("open first");
        let second = SqliteStore::open(&db_path).expect("open second");
        let lock_path = second.lock_path().expect("lock path");

        let guard = run_lock(&first).expect("lock first");
        assert!(
            LockFile::try_acquire(&lock_path)
                .expect("try while held")
                .is_none()
        );

        drop(guard);
        let reacquired = LockFile::try_acquire(&lock_path).expect("try after release");
        assert!(reacquired.is_some());
    }

    #[test]
    fn file_lock_excludes_a_second_holder_until_dropped() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("run.lock");

        let held = LockFile::acquire(&path).expect("acquire");
        assert!(LockFile::try_acquire(&path).expect("try lock").is_none());
        drop(held);
        assert!(LockFile::try_acquire(&path).expect("try lock").is_some());
    }
}
