//! Cross-process advisory locking for the JSON documents.
//!
//! Uses `fs2` so the same code works with flock on Unix and LockFileEx on
//! Windows. Acquisition polls `try_lock_exclusive` until the configured
//! timeout expires; the lock is released when the guard is dropped.

use crate::errors::LockError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file path for a document: `tasks.json` -> `tasks.json.lock`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut raw = target.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

/// An advisory lock bound to one document.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

impl FileLock {
    pub fn for_target(target: &Path, timeout: Duration) -> Self {
        Self {
            path: lock_path_for(target),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or the timeout elapses.
    pub fn acquire(&self) -> Result<FileLockGuard, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock {}", self.path.display());
                    return Ok(FileLockGuard {
                        file,
                        path: self.path.clone(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(self.timeout - waited));
                }
                Err(source) => {
                    return Err(LockError::Acquire {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Holds an exclusive lock until dropped.
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

impl std::fmt::Debug for FileLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockGuard")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/data/tasks.json")),
            PathBuf::from("/data/tasks.json.lock")
        );
        assert_eq!(
            lock_path_for(Path::new("ledger")),
            PathBuf::from("ledger.lock")
        );
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("tasks.json");
        let lock = FileLock::for_target(&target, Duration::from_millis(150));

        let guard = lock.acquire().unwrap();
        let started = Instant::now();
        match lock.acquire() {
            Err(LockError::Timeout { path, .. }) => assert_eq!(path, lock_path_for(&target)),
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(150));

        drop(guard);
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("ledger.json");
        let lock = FileLock::for_target(&target, Duration::from_secs(5));

        let guard = lock.acquire().unwrap();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(120));
        drop(guard);
        assert!(waiter.join().unwrap().is_ok());
    }
}
