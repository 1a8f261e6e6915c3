//! Filesystem-based locking for cross-process coordination
//!
//! Two revfeed processes polling the same repository would fight over one working
//! copy and one checkpoint row. An exclusive `flock()` on a per-repository lock file
//! keeps them apart; the in-process side lives in `repo_lock.rs`.

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Lock file for a repository name
fn lock_file_path(lock_dir: &Path, repo_name: &str) -> PathBuf {
    // Hash the name so any repository name yields a safe file name
    let mut hasher = Sha256::new();
    hasher.update(repo_name.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    lock_dir.join(format!("repo-{}.lock", &hash[..16]))
}

/// Guard that holds an exclusive filesystem lock
///
/// The lock is released when the guard is dropped, or by the OS if the process dies.
pub struct FsLockGuard {
    _file: File,
    path: PathBuf,
}

impl FsLockGuard {
    /// Try to acquire the lock without waiting
    ///
    /// Returns `Ok(None)` if another holder has it.
    pub fn try_acquire(lock_dir: &Path, repo_name: &str) -> Result<Option<Self>> {
        let lock_path = lock_file_path(lock_dir, repo_name);

        fs::create_dir_all(lock_dir).context("Failed to create lock directory")?;
        let file = File::create(&lock_path).context("Failed to create lock file")?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired repository lock for {} ({:?})", repo_name, lock_path);
                Ok(Some(Self {
                    _file: file,
                    path: lock_path,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::debug!("Repository lock for {} is held elsewhere", repo_name);
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to acquire repository lock"),
        }
    }

    /// Poll for the lock until it is acquired or `timeout` expires
    pub fn acquire_blocking(lock_dir: &Path, repo_name: &str, timeout: Duration) -> Result<Option<Self>> {
        let start = Instant::now();
        let sleep_interval = Duration::from_millis(250);

        loop {
            if let Some(guard) = Self::try_acquire(lock_dir, repo_name)? {
                return Ok(Some(guard));
            }
            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Timeout waiting for repository lock on {} after {:?}",
                    repo_name,
                    timeout
                );
                return Ok(None);
            }
            std::thread::sleep(sleep_interval);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FsLockGuard {
    fn drop(&mut self) {
        // The lock file itself is kept and reused
        tracing::debug!("Releasing repository lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();

        let guard = FsLockGuard::try_acquire(dir.path(), "payments").unwrap();
        assert!(guard.is_some());
        drop(guard);

        let again = FsLockGuard::try_acquire(dir.path(), "payments").unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_concurrent_lock_fails() {
        let dir = TempDir::new().unwrap();
        let guard = FsLockGuard::try_acquire(dir.path(), "payments").unwrap();
        assert!(guard.is_some());

        let lock_dir = dir.path().to_path_buf();
        let handle = thread::spawn(move || FsLockGuard::try_acquire(&lock_dir, "payments").unwrap());
        assert!(handle.join().unwrap().is_none(), "second holder must be refused");

        // Other repositories are unaffected
        assert!(FsLockGuard::try_acquire(dir.path(), "ledger").unwrap().is_some());
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let _guard = FsLockGuard::try_acquire(dir.path(), "payments").unwrap().unwrap();

        let lock_dir = dir.path().to_path_buf();
        let handle = thread::spawn(move || {
            FsLockGuard::acquire_blocking(&lock_dir, "payments", Duration::from_millis(100)).unwrap()
        });
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn test_lock_file_names() {
        let dir = Path::new("/var/lib/revfeed/locks");
        let a = lock_file_path(dir, "payments");
        assert_eq!(a, lock_file_path(dir, "payments"));
        assert_ne!(a, lock_file_path(dir, "ledger"));
        assert_ne!(a, lock_file_path(dir, "../payments"));
        assert!(a.starts_with(dir));
    }
}
