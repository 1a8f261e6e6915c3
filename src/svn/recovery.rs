//! Working-copy corruption detection and the escalating recovery ladder.
//!
//! An interrupted `svn update` leaves the working copy locked or with a half-applied
//! work queue. Recovery escalates from a plain `svn cleanup` up to a full re-checkout;
//! each rung is a [`RecoveryAction`] and the order is driven by [`RecoveryLadder`].

use std::path::Path;

/// stderr fragments (lowercase) that indicate a broken working copy rather than a
/// network, auth or server problem
const CORRUPTION_SIGNATURES: &[&str] = &[
    "e155004",
    "e155016",
    "e155037",
    "needs cleanup",
    "previous operation has not finished",
    "work queue",
    "run 'svn cleanup'",
    "database is locked",
    "wc.db",
];

/// Lock and journal files left behind by an interrupted svn process, relative to the
/// working-copy root
pub const STALE_LOCK_FILES: &[&str] = &[
    ".svn/lock",
    ".svn/wc.db-journal",
    ".svn/wc.db-wal",
    ".svn/wc.db-shm",
];

/// Whether svn output describes working-copy corruption
pub fn is_corruption_message(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    if lower.contains("working copy") && lower.contains("locked") {
        return true;
    }
    CORRUPTION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// One rung of the recovery ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// `svn cleanup`, then update
    Cleanup,
    /// `svn cleanup --remove-unversioned --remove-ignored`, then update
    CleanupRemoveUnversioned,
    /// Delete stale lock files, then cleanup and update
    ClearLocksAndCleanup,
    /// Move the working copy aside and check out from scratch
    Rebuild,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Cleanup => "cleanup",
            RecoveryAction::CleanupRemoveUnversioned => "cleanup_remove_unversioned",
            RecoveryAction::ClearLocksAndCleanup => "clear_locks_and_cleanup",
            RecoveryAction::Rebuild => "rebuild",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the ladder currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderState {
    /// Next action to try
    Pending(usize),
    /// Every action was tried
    Exhausted,
}

/// Ordered recovery actions, each tried at most once
#[derive(Debug, Clone)]
pub struct RecoveryLadder {
    actions: Vec<RecoveryAction>,
    state: LadderState,
}

impl Default for RecoveryLadder {
    fn default() -> Self {
        Self::new(vec![
            RecoveryAction::Cleanup,
            RecoveryAction::CleanupRemoveUnversioned,
            RecoveryAction::ClearLocksAndCleanup,
            RecoveryAction::Rebuild,
        ])
    }
}

impl RecoveryLadder {
    pub fn new(actions: Vec<RecoveryAction>) -> Self {
        let state = if actions.is_empty() {
            LadderState::Exhausted
        } else {
            LadderState::Pending(0)
        };
        Self { actions, state }
    }

    /// Advance to the next action; `None` once the ladder is exhausted
    pub fn next_action(&mut self) -> Option<RecoveryAction> {
        match self.state {
            LadderState::Pending(idx) => {
                let action = self.actions[idx];
                self.state = if idx + 1 < self.actions.len() {
                    LadderState::Pending(idx + 1)
                } else {
                    LadderState::Exhausted
                };
                Some(action)
            }
            LadderState::Exhausted => None,
        }
    }

    pub fn state(&self) -> LadderState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == LadderState::Exhausted
    }
}

impl Iterator for RecoveryLadder {
    type Item = RecoveryAction;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_action()
    }
}

/// Delete stale lock files and leftover `.svn/tmp/*.tmp` files
///
/// Returns how many files were removed. Missing files are not an error.
pub fn clear_stale_locks(working_copy: &Path) -> std::io::Result<usize> {
    let mut removed = 0;

    for rel in STALE_LOCK_FILES {
        let path = working_copy.join(rel);
        if path.is_file() {
            std::fs::remove_file(&path)?;
            tracing::debug!("Removed stale lock file {}", path.display());
            removed += 1;
        }
    }

    let tmp_dir = working_copy.join(".svn").join("tmp");
    if tmp_dir.is_dir() {
        for entry in std::fs::read_dir(&tmp_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "tmp") {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_corruption_signatures() {
        assert!(is_corruption_message(
            "svn: E155037: Previous operation has not finished; run 'cleanup' if it was interrupted"
        ));
        assert!(is_corruption_message("svn: E155004: Run 'svn cleanup' to remove locks"));
        assert!(is_corruption_message("svn: E155004: Working copy '/wc' locked."));
        assert!(is_corruption_message("svn: E200030: sqlite[S5]: database is locked"));
        assert!(is_corruption_message("svn: E155016: The working copy database at '/wc' is corrupt (wc.db)"));

        assert!(!is_corruption_message("svn: E170013: Unable to connect to a repository"));
        assert!(!is_corruption_message("svn: E170001: Authorization failed"));
        assert!(!is_corruption_message(""));
    }

    #[test]
    fn test_auth_and_server_locks_are_not_corruption() {
        assert!(!is_corruption_message("svn: E170001: Authorization failed: account locked"));
        assert!(!is_corruption_message(
            "svn: E175002: Unexpected HTTP status 423 'Locked' on '/repos/payments/trunk/pay.py'"
        ));
        assert!(!is_corruption_message(
            "svn: E200030: sqlite[S11]: database disk image is malformed"
        ));
        assert!(!is_corruption_message("svn: E160035: Path '/trunk/pay.py' is already locked by user 'bob'"));
    }

    #[test]
    fn test_default_ladder_order() {
        let actions: Vec<_> = RecoveryLadder::default().collect();
        assert_eq!(
            actions,
            vec![
                RecoveryAction::Cleanup,
                RecoveryAction::CleanupRemoveUnversioned,
                RecoveryAction::ClearLocksAndCleanup,
                RecoveryAction::Rebuild,
            ]
        );
    }

    #[test]
    fn test_ladder_reaches_exhausted() {
        let mut ladder = RecoveryLadder::new(vec![RecoveryAction::Cleanup]);
        assert_eq!(ladder.state(), LadderState::Pending(0));
        assert_eq!(ladder.next_action(), Some(RecoveryAction::Cleanup));
        assert!(ladder.is_exhausted());
        assert_eq!(ladder.next_action(), None);

        let empty = RecoveryLadder::new(Vec::new());
        assert!(empty.is_exhausted());
    }

    #[test]
    fn test_clear_stale_locks() {
        let dir = TempDir::new().unwrap();
        let svn = dir.path().join(".svn");
        std::fs::create_dir_all(svn.join("tmp")).unwrap();
        std::fs::write(svn.join("lock"), "").unwrap();
        std::fs::write(svn.join("wc.db-journal"), "").unwrap();
        std::fs::write(svn.join("wc.db"), "keep").unwrap();
        std::fs::write(svn.join("tmp").join("svn-1.tmp"), "").unwrap();
        std::fs::write(svn.join("tmp").join("keep.txt"), "").unwrap();

        assert_eq!(clear_stale_locks(dir.path()).unwrap(), 3);
        assert!(!svn.join("lock").exists());
        assert!(svn.join("wc.db").exists());
        assert!(svn.join("tmp").join("keep.txt").exists());

        // Nothing left to remove
        assert_eq!(clear_stale_locks(dir.path()).unwrap(), 0);
    }
}
