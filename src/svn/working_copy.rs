//! Local working-copy mirror of a remote repository.

use super::command::{SvnRunner, args};
use super::recovery::{RecoveryAction, RecoveryLadder, clear_stale_locks, is_corruption_message};
use crate::error::SvnError;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

/// Keeps one working copy checked out and up to date, repairing it when an
/// interrupted operation left it unusable
pub struct WorkingCopyManager {
    runner: Arc<dyn SvnRunner>,
    remote_url: String,
    local_path: PathBuf,
}

impl WorkingCopyManager {
    pub fn new(
        runner: Arc<dyn SvnRunner>,
        remote_url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            remote_url: remote_url.into(),
            local_path: local_path.into(),
        }
    }

    fn path_arg(&self) -> String {
        self.local_path.to_string_lossy().into_owned()
    }

    /// True iff the administrative `.svn` directory exists
    pub fn is_checked_out(&self) -> bool {
        self.local_path.join(".svn").is_dir()
    }

    /// Check out the remote repository unless a working copy already exists
    pub async fn ensure_checked_out(&self) -> Result<(), SvnError> {
        if self.is_checked_out() {
            return Ok(());
        }

        tracing::info!(
            "Checking out {} into {}",
            self.remote_url,
            self.local_path.display()
        );
        self.checkout().await
    }

    async fn checkout(&self) -> Result<(), SvnError> {
        if let Some(parent) = self.local_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SvnError::CheckoutFailed {
                    url: self.remote_url.clone(),
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
        }

        let path = self.path_arg();
        let output = self
            .runner
            .run(&args(["checkout", self.remote_url.as_str(), path.as_str()]), None)
            .await
            .map_err(|e| SvnError::CheckoutFailed {
                url: self.remote_url.clone(),
                reason: e.to_string(),
            })?;

        if !output.success {
            return Err(SvnError::CheckoutFailed {
                url: self.remote_url.clone(),
                reason: output.error_text(),
            });
        }
        Ok(())
    }

    /// Bring the working copy to HEAD
    ///
    /// A failure whose output matches a corruption signature runs the recovery ladder;
    /// any other failure is returned as [`SvnError::UpdateFailed`] without retrying.
    pub async fn update(&self) -> Result<bool, SvnError> {
        let error = match self.try_update().await {
            Ok(()) => return Ok(true),
            Err(reason) => self.classify_failure(reason),
        };
        if !error.is_corruption() {
            return Err(error);
        }

        tracing::warn!("Working copy {} needs recovery: {}", self.local_path.display(), error);
        self.recover(error.to_string()).await?;
        Ok(true)
    }

    /// Corruption signatures become [`SvnError::WorkingCopyCorrupted`], anything else [`SvnError::UpdateFailed`]
    fn classify_failure(&self, reason: String) -> SvnError {
        if is_corruption_message(&reason) {
            self.corrupted(reason)
        } else {
            SvnError::UpdateFailed {
                path: self.path_arg(),
                reason,
            }
        }
    }

    /// Checkout if needed, then update
    pub async fn sync(&self) -> Result<bool, SvnError> {
        self.ensure_checked_out().await?;
        self.update().await
    }

    /// Walk the recovery ladder until one action leaves an updatable working copy
    pub async fn recover(&self, reason: String) -> Result<(), SvnError> {
        let mut last_error = reason;

        for action in RecoveryLadder::default() {
            tracing::info!("Recovering {} with {}", self.local_path.display(), action);
            match self.apply(action).await {
                Ok(()) => {
                    tracing::info!("Recovered {} with {}", self.local_path.display(), action);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Recovery step {} failed: {}", action, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(SvnError::WorkingCopyCorrupted {
            path: self.path_arg(),
            reason: last_error,
        })
    }

    /// Run a single recovery action
    pub async fn apply(&self, action: RecoveryAction) -> Result<(), SvnError> {
        match action {
            RecoveryAction::Cleanup => {
                self.cleanup(&[]).await?;
                self.update_or_corrupted().await
            }
            RecoveryAction::CleanupRemoveUnversioned => {
                self.cleanup(&["--remove-unversioned", "--remove-ignored"])
                    .await?;
                self.update_or_corrupted().await
            }
            RecoveryAction::ClearLocksAndCleanup => {
                let path = self.local_path.clone();
                let removed = tokio::task::spawn_blocking(move || clear_stale_locks(&path))
                    .await
                    .map_err(|e| self.corrupted(format!("lock removal task failed: {}", e)))?
                    .map_err(|e| self.corrupted(format!("cannot remove lock files: {}", e)))?;
                tracing::debug!("Removed {} stale lock files", removed);

                self.cleanup(&[]).await?;
                self.update_or_corrupted().await
            }
            RecoveryAction::Rebuild => self.rebuild().await,
        }
    }

    fn corrupted(&self, reason: String) -> SvnError {
        SvnError::WorkingCopyCorrupted {
            path: self.path_arg(),
            reason,
        }
    }

    /// Run `svn update`, returning the failure text on error
    async fn try_update(&self) -> Result<(), String> {
        let path = self.path_arg();
        match self
            .runner
            .run(&args(["update", path.as_str()]), None)
            .await
        {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(output.error_text()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn update_or_corrupted(&self) -> Result<(), SvnError> {
        self.try_update().await.map_err(|reason| self.corrupted(reason))
    }

    async fn cleanup(&self, flags: &[&str]) -> Result<(), SvnError> {
        let mut argv = args(["cleanup"]);
        argv.extend(args(flags.iter().copied()));
        argv.push(self.path_arg());

        let output = self
            .runner
            .run(&argv, None)
            .await
            .map_err(|e| self.corrupted(e.to_string()))?;
        if !output.success {
            return Err(self.corrupted(format!("cleanup failed: {}", output.error_text())));
        }
        Ok(())
    }

    /// Move the working copy aside and check out a fresh one
    ///
    /// The backup is deleted once the new checkout succeeds and restored otherwise.
    async fn rebuild(&self) -> Result<(), SvnError> {
        let backup = self.backup_path();
        let had_copy = tokio::fs::try_exists(&self.local_path).await.unwrap_or(false);

        if had_copy {
            tokio::fs::rename(&self.local_path, &backup)
                .await
                .map_err(|e| self.corrupted(format!("cannot move working copy aside: {}", e)))?;
            tracing::info!("Moved {} to {}", self.local_path.display(), backup.display());
        }

        match self.checkout().await {
            Ok(()) => {
                if had_copy && let Err(e) = tokio::fs::remove_dir_all(&backup).await {
                    tracing::warn!("Failed to remove backup {}: {}", backup.display(), e);
                }
                Ok(())
            }
            Err(e) => {
                if tokio::fs::try_exists(&self.local_path).await.unwrap_or(false)
                    && let Err(rm) = tokio::fs::remove_dir_all(&self.local_path).await
                {
                    tracing::warn!(
                        "Failed to remove partial checkout {}: {}",
                        self.local_path.display(),
                        rm
                    );
                }
                if had_copy && let Err(mv) = tokio::fs::rename(&backup, &self.local_path).await {
                    tracing::error!(
                        "Failed to restore {} from {}: {}",
                        self.local_path.display(),
                        backup.display(),
                        mv
                    );
                }
                Err(self.corrupted(format!("rebuild failed: {}", e)))
            }
        }
    }

    fn backup_path(&self) -> PathBuf {
        let name = self
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "working-copy".to_string());
        self.local_path.with_file_name(format!(
            "{}.backup-{}",
            name,
            Utc::now().format("%Y%m%d%H%M%S")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svn::command::CommandOutput;
    use crate::svn::testing::ScriptedRunner;
    use std::path::Path;
    use tempfile::TempDir;

    const URL: &str = "svn://svn.example.com/payments/trunk";
    const LOCKED: &str = "svn: E155004: Run 'svn cleanup' to remove locks";

    /// Checkouts create the `.svn` directory like the real client does
    fn runner_with_checkout() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_responder(|argv, _| {
            if argv.first().map(String::as_str) == Some("checkout") {
                let target = Path::new(&argv[2]);
                std::fs::create_dir_all(target.join(".svn")).ok()?;
                return Some(CommandOutput::ok("Checked out revision 10."));
            }
            None
        });
        runner
    }

    fn checked_out(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("mirror");
        std::fs::create_dir_all(path.join(".svn")).unwrap();
        path
    }

    fn entries(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_ensure_checked_out_runs_checkout_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("mirror");
        let runner = runner_with_checkout();
        let wc = WorkingCopyManager::new(runner.clone(), URL, &path);

        assert!(!wc.is_checked_out());
        wc.ensure_checked_out().await.unwrap();
        assert!(wc.is_checked_out());
        wc.ensure_checked_out().await.unwrap();

        let calls = runner.calls_to("checkout");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], args(["checkout", URL, &*path.to_string_lossy()]));
    }

    #[tokio::test]
    async fn test_checkout_failure() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("checkout", CommandOutput::failed("svn: E170001: Authorization failed"));
        let wc = WorkingCopyManager::new(runner, URL, dir.path().join("mirror"));

        let result = wc.ensure_checked_out().await;
        assert!(matches!(result, Err(SvnError::CheckoutFailed { .. })));
    }

    #[tokio::test]
    async fn test_update_success() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("update", CommandOutput::ok("At revision 12."));
        let wc = WorkingCopyManager::new(runner.clone(), URL, checked_out(&dir));

        assert!(wc.update().await.unwrap());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_non_corruption_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("update", CommandOutput::failed("svn: E170013: Unable to connect"));
        let wc = WorkingCopyManager::new(runner.clone(), URL, checked_out(&dir));

        let result = wc.update().await;
        assert!(matches!(result, Err(SvnError::UpdateFailed { .. })));
        assert!(runner.calls_to("cleanup").is_empty());
        assert_eq!(runner.calls_to("update").len(), 1);
    }

    #[tokio::test]
    async fn test_locked_account_skips_recovery() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(
            "update",
            CommandOutput::failed("svn: E170001: Authorization failed: account locked"),
        );
        let wc = WorkingCopyManager::new(runner.clone(), URL, checked_out(&dir));

        let result = wc.update().await;
        assert!(matches!(result, Err(SvnError::UpdateFailed { .. })));
        assert!(runner.calls_to("cleanup").is_empty());
        assert!(runner.calls_to("checkout").is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_recovers_locked_copy() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("update", CommandOutput::failed(LOCKED));
        runner.push("cleanup", CommandOutput::ok(""));
        runner.push("update", CommandOutput::ok("At revision 12."));
        let path = checked_out(&dir);
        let wc = WorkingCopyManager::new(runner.clone(), URL, &path);

        assert!(wc.update().await.unwrap());
        assert_eq!(
            runner.calls_to("cleanup"),
            vec![args(["cleanup", &*path.to_string_lossy()])]
        );
    }

    #[tokio::test]
    async fn test_escalates_to_clearing_locks() {
        let dir = TempDir::new().unwrap();
        let path = checked_out(&dir);
        std::fs::write(path.join(".svn").join("lock"), "").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.set_default("cleanup", CommandOutput::ok(""));
        // initial, after cleanup, after cleanup --remove-unversioned
        for _ in 0..3 {
            runner.push("update", CommandOutput::failed(LOCKED));
        }
        runner.push("update", CommandOutput::ok("At revision 12."));
        let wc = WorkingCopyManager::new(runner.clone(), URL, &path);

        assert!(wc.update().await.unwrap());
        assert!(!path.join(".svn").join("lock").exists());

        let cleanups = runner.calls_to("cleanup");
        assert_eq!(cleanups.len(), 3);
        assert!(cleanups[1].contains(&"--remove-unversioned".to_string()));
        assert!(runner.calls_to("checkout").is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_working_copy() {
        let dir = TempDir::new().unwrap();
        let path = checked_out(&dir);
        std::fs::write(path.join("stale.py"), "x").unwrap();

        let runner = runner_with_checkout();
        runner.set_default("cleanup", CommandOutput::ok(""));
        runner.set_default("update", CommandOutput::failed(LOCKED));
        let wc = WorkingCopyManager::new(runner.clone(), URL, &path);

        assert!(wc.update().await.unwrap());
        assert_eq!(runner.calls_to("checkout").len(), 1);
        assert!(wc.is_checked_out());
        assert!(!path.join("stale.py").exists());
        // backup removed after a successful rebuild
        assert_eq!(entries(&dir), vec!["mirror".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_rebuild_restores_backup() {
        let dir = TempDir::new().unwrap();
        let path = checked_out(&dir);
        std::fs::write(path.join("keep.py"), "x").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.set_default("cleanup", CommandOutput::ok(""));
        runner.set_default("update", CommandOutput::failed(LOCKED));
        runner.set_default("checkout", CommandOutput::failed("svn: E170013: Unable to connect"));
        let wc = WorkingCopyManager::new(runner, URL, &path);

        let result = wc.update().await;
        assert!(matches!(result, Err(SvnError::WorkingCopyCorrupted { .. })));
        assert!(path.join("keep.py").exists());
        assert_eq!(entries(&dir), vec!["mirror".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_single_action() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("cleanup", CommandOutput::failed("svn: E155009: cleanup failed"));
        let wc = WorkingCopyManager::new(runner.clone(), URL, checked_out(&dir));

        let result = wc.apply(RecoveryAction::Cleanup).await;
        assert!(matches!(result, Err(SvnError::WorkingCopyCorrupted { .. })));
        assert!(runner.calls_to("update").is_empty());
    }

    #[tokio::test]
    async fn test_sync_checks_out_then_updates() {
        let dir = TempDir::new().unwrap();
        let runner = runner_with_checkout();
        runner.set_default("update", CommandOutput::ok("At revision 10."));
        let wc = WorkingCopyManager::new(runner.clone(), URL, dir.path().join("mirror"));

        assert!(wc.sync().await.unwrap());
        let subcommands: Vec<String> = runner.calls().iter().map(|c| c[0].clone()).collect();
        assert_eq!(subcommands, vec!["checkout".to_string(), "update".to_string()]);
    }
}
