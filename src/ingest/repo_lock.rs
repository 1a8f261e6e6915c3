//! At most one in-flight cycle per repository name
//!
//! Two layers:
//! 1. In-memory registry (in-process) - a second cycle for a busy repository is refused at once
//! 2. Filesystem lock (cross-process) - another revfeed process polling the same repository

use super::fs_lock::FsLockGuard;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A cycle running longer than this is assumed to have crashed without releasing
const MAX_CYCLE_DURATION: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct ActiveCycle {
    token: u64,
    started_at: Instant,
}

impl ActiveCycle {
    fn is_stale(&self) -> bool {
        self.started_at.elapsed() > MAX_CYCLE_DURATION
    }
}

/// Result of trying to lock a repository
pub enum RepoLockResult {
    /// This cycle owns the repository until the guard is released
    Acquired(RepoLockGuard),
    /// Another cycle in this process is working on it
    InFlight,
    /// Another process holds the repository lock
    HeldElsewhere,
}

/// Per-repository lock registry
#[derive(Clone)]
pub struct RepoLocks {
    active: Arc<RwLock<HashMap<String, ActiveCycle>>>,
    next_token: Arc<AtomicU64>,
    lock_dir: PathBuf,
    wait: Duration,
}

impl RepoLocks {
    /// `wait` is how long to wait for another process's lock (zero = don't wait)
    pub fn new(lock_dir: impl Into<PathBuf>, wait: Duration) -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
            lock_dir: lock_dir.into(),
            wait,
        }
    }

    pub async fn try_acquire(&self, repo_name: &str) -> Result<RepoLockResult> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.active.write().await;
            if let Some(existing) = active.get(repo_name) {
                if !existing.is_stale() {
                    return Ok(RepoLockResult::InFlight);
                }
                tracing::warn!(
                    "Cycle for {} has been running for {:?}, taking over its lock",
                    repo_name,
                    existing.started_at.elapsed()
                );
            }
            active.insert(
                repo_name.to_string(),
                ActiveCycle {
                    token,
                    started_at: Instant::now(),
                },
            );
        }

        let lock_dir = self.lock_dir.clone();
        let name = repo_name.to_string();
        let wait = self.wait;
        let fs_result = tokio::task::spawn_blocking(move || {
            if wait.is_zero() {
                FsLockGuard::try_acquire(&lock_dir, &name)
            } else {
                FsLockGuard::acquire_blocking(&lock_dir, &name, wait)
            }
        })
        .await
        .map_err(|e| anyhow!("Lock task failed: {}", e))
        .and_then(|r| r);

        match fs_result {
            Ok(Some(fs_lock)) => {
                tracing::debug!("Cycle for {} holds {:?}", repo_name, fs_lock.path());
                Ok(RepoLockResult::Acquired(RepoLockGuard {
                    repo_name: repo_name.to_string(),
                    token,
                    active: self.active.clone(),
                    released: false,
                    _fs_lock: fs_lock,
                }))
            }
            Ok(None) => {
                self.forget(repo_name, token).await;
                Ok(RepoLockResult::HeldElsewhere)
            }
            Err(e) => {
                self.forget(repo_name, token).await;
                Err(e)
            }
        }
    }

    async fn forget(&self, repo_name: &str, token: u64) {
        remove_if_owned(&self.active, repo_name, token).await;
    }

    /// Names of repositories with a cycle in flight
    pub async fn in_flight(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

async fn remove_if_owned(active: &RwLock<HashMap<String, ActiveCycle>>, repo_name: &str, token: u64) {
    let mut active = active.write().await;
    if active.get(repo_name).is_some_and(|c| c.token == token) {
        active.remove(repo_name);
    }
}

/// Holds both locks for one repository
pub struct RepoLockGuard {
    repo_name: String,
    token: u64,
    active: Arc<RwLock<HashMap<String, ActiveCycle>>>,
    released: bool,
    _fs_lock: FsLockGuard,
}

impl RepoLockGuard {
    /// Release the lock explicitly at the end of a cycle
    pub async fn release(mut self) {
        remove_if_owned(&self.active, &self.repo_name, self.token).await;
        self.released = true;
    }
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Fallback for panics and early returns
        tracing::warn!(
            "Lock for {} dropped without explicit release - spawning cleanup task",
            self.repo_name
        );
        let active = self.active.clone();
        let repo_name = self.repo_name.clone();
        let token = self.token;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                remove_if_owned(&active, &repo_name, token).await;
            });
        }
    }
}
