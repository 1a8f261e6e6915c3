//! Ingestion orchestrator
//!
//! One poll cycle walks every configured repository through
//! `Idle → Syncing → Fetching → (Extracting → Classifying → Deduplicating → Delivering)* → Checkpointing`.
//! Repositories run concurrently up to `max_concurrent_repositories`; within one
//! repository commits are handled strictly in log order. Failures are recorded in the
//! report and never abort the rest of the batch.

mod fs_lock;
mod repo_lock;


pub use repo_lock::{RepoLockGuard, RepoLockResult, RepoLocks};

use crate::config::{Config, RepositoryConfig};
use crate::error::StoreError;
use crate::merge::MergeClassifier;
use crate::review::{EventEmitter, Reviewer};
use crate::store::{self, CheckpointStore, Database, NewVersion, VersionStore, fingerprint};
use crate::svn::{ChangeExtractor, ExtensionFilter, LogFetcher, RunnerFactory, SvnRunner, WorkingCopyManager};
use crate::types::{Change, Commit, ReviewCompleted, Window, branch_from_paths};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Review type stored with every version record written by the poller
pub const REVIEW_TYPE: &str = "svn_incremental";

/// Per-repository pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Idle,
    Syncing,
    Fetching,
    Extracting,
    Classifying,
    Deduplicating,
    Delivering,
    Checkpointing,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::Idle => "idle",
            CycleStage::Syncing => "syncing",
            CycleStage::Fetching => "fetching",
            CycleStage::Extracting => "extracting",
            CycleStage::Classifying => "classifying",
            CycleStage::Deduplicating => "deduplicating",
            CycleStage::Delivering => "delivering",
            CycleStage::Checkpointing => "checkpointing",
        }
    }
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    /// Sent for review and recorded
    Reviewed {
        revision: String,
        version_hash: String,
        score: i64,
    },
    /// Same change-set was processed before
    Duplicate {
        revision: String,
        version_hash: String,
    },
    /// Merge commit in a repository that opted out of merge review
    SkippedMerge { revision: String },
    /// Nothing reviewable (deletions, directories, filtered extensions)
    NoChanges { revision: String },
    /// Aborted at `stage`; nothing was recorded
    Failed {
        revision: String,
        stage: CycleStage,
        error: String,
    },
}

impl CommitOutcome {
    pub fn revision(&self) -> &str {
        match self {
            CommitOutcome::Reviewed { revision, .. }
            | CommitOutcome::Duplicate { revision, .. }
            | CommitOutcome::SkippedMerge { revision }
            | CommitOutcome::NoChanges { revision }
            | CommitOutcome::Failed { revision, .. } => revision,
        }
    }
}

/// How a repository's part of the cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    /// Ran to the checkpoint step (sync/fetch failures included)
    Completed,
    /// Stopped between commits
    Cancelled,
    /// Another cycle for this repository is still running
    InFlight,
    /// The state store failed; the checkpoint did not move
    Failed,
}

/// Result of one repository within a cycle
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryReport {
    pub repo_name: String,
    pub status: RepositoryStatus,
    pub window: Option<Window>,
    pub commits_found: usize,
    pub outcomes: Vec<CommitOutcome>,
    pub sync_error: Option<String>,
    pub fetch_error: Option<String>,
    /// The log hit `log_limit`; the rest of the window is picked up next cycle
    pub log_truncated: bool,
    pub error: Option<String>,
    pub checkpoint_advanced: bool,
}

impl RepositoryReport {
    fn new(repo_name: &str, status: RepositoryStatus) -> Self {
        Self {
            repo_name: repo_name.to_string(),
            status,
            window: None,
            commits_found: 0,
            outcomes: Vec::new(),
            sync_error: None,
            fetch_error: None,
            log_truncated: false,
            error: None,
            checkpoint_advanced: false,
        }
    }

    fn failed(mut self, error: impl std::fmt::Display) -> Self {
        self.status = RepositoryStatus::Failed;
        self.error = Some(error.to_string());
        self
    }

    pub fn reviewed(&self) -> usize {
        self.count(|o| matches!(o, CommitOutcome::Reviewed { .. }))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, CommitOutcome::Duplicate { .. }))
    }

    pub fn failures(&self) -> usize {
        self.count(|o| matches!(o, CommitOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&CommitOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Result of one poll cycle across all repositories
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub repositories: Vec<RepositoryReport>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn reviewed(&self) -> usize {
        self.repositories.iter().map(RepositoryReport::reviewed).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.repositories.iter().map(RepositoryReport::duplicates).sum()
    }

    pub fn failures(&self) -> usize {
        self.repositories.iter().map(RepositoryReport::failures).sum()
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryReport> {
        self.repositories.iter().find(|r| r.repo_name == name)
    }
}

/// Coordinates the working copy, log, extractor, classifier and stores for every repository
pub struct Ingestor {
    config: Arc<Config>,
    checkpoints: CheckpointStore,
    versions: VersionStore,
    runners: Arc<dyn RunnerFactory>,
    reviewer: Arc<dyn Reviewer>,
    emitter: Arc<dyn EventEmitter>,
    classifier: MergeClassifier,
    filter: ExtensionFilter,
    pub(crate) locks: RepoLocks,
}

impl Ingestor {
    pub fn new(
        config: Config,
        database: Database,
        runners: Arc<dyn RunnerFactory>,
        reviewer: Arc<dyn Reviewer>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<Self, StoreError> {
        let checkpoints = CheckpointStore::new(database.clone())?;
        let versions = VersionStore::new(database)?;
        let classifier = MergeClassifier::new(config.merge.clone());
        let filter = ExtensionFilter::new(&config.ingest.reviewable_extensions);
        let locks = RepoLocks::new(
            config.store.lock_dir.clone(),
            Duration::from_secs(config.ingest.lock_timeout_secs),
        );

        Ok(Self {
            config: Arc::new(config),
            checkpoints,
            versions,
            runners,
            reviewer,
            emitter,
            classifier,
            filter,
            locks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Run one poll cycle over every configured repository
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let start = Instant::now();
        let workers = self.config.ingest.max_concurrent_repositories.max(1);
        tracing::info!(
            "Starting poll cycle over {} repositories ({} workers)",
            self.config.repositories.len(),
            workers
        );

        let mut repositories: Vec<RepositoryReport> = stream::iter(self.config.repositories.iter())
            .map(|repo| self.run_repository(repo, cancel))
            .buffer_unordered(workers)
            .collect()
            .await;
        repositories.sort_by(|a, b| a.repo_name.cmp(&b.repo_name));

        let report = CycleReport {
            repositories,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "Poll cycle finished in {}ms: {} reviewed, {} duplicates, {} failed commits",
            report.duration_ms,
            report.reviewed(),
            report.duplicates(),
            report.failures()
        );
        report
    }

    /// Run one repository through the pipeline, holding its lock for the duration
    pub async fn run_repository(&self, repo: &RepositoryConfig, cancel: &CancellationToken) -> RepositoryReport {
        let span = tracing::info_span!("repository", name = %repo.name);
        async {
            let guard = match self.locks.try_acquire(&repo.name).await {
                Ok(RepoLockResult::Acquired(guard)) => guard,
                Ok(RepoLockResult::InFlight) | Ok(RepoLockResult::HeldElsewhere) => {
                    tracing::info!("Skipping {}: a cycle is already in flight", repo.name);
                    return RepositoryReport::new(&repo.name, RepositoryStatus::InFlight);
                }
                Err(e) => {
                    tracing::error!("Failed to lock {}: {:#}", repo.name, e);
                    return RepositoryReport::new(&repo.name, RepositoryStatus::Failed)
                        .failed(format!("{:#}", e));
                }
            };

            let report = self.process_repository(repo, cancel).await;
            guard.release().await;
            report
        }
        .instrument(span)
        .await
    }

    async fn process_repository(&self, repo: &RepositoryConfig, cancel: &CancellationToken) -> RepositoryReport {
        let mut report = RepositoryReport::new(&repo.name, RepositoryStatus::Completed);
        if cancel.is_cancelled() {
            report.status = RepositoryStatus::Cancelled;
            return report;
        }
        stage(repo, CycleStage::Idle);

        let checkpoints = self.checkpoints.clone();
        let name = repo.name.clone();
        let lookback = repo.lookback(self.config.ingest.default_lookback_hours);
        let window = match store::blocking(move || checkpoints.get_window(&name, lookback)).await {
            Ok(window) => window,
            Err(e) => {
                tracing::error!("Cannot read checkpoint for {}: {}", repo.name, e);
                return report.failed(e);
            }
        };
        report.window = Some(window);

        let runner = self.runners.for_repository(repo);
        let commits = self.sync_and_fetch(repo, runner.clone(), window, &mut report).await;
        report.commits_found = commits.len();
        let limit = self.config.ingest.log_limit;
        if limit > 0 && commits.len() >= limit {
            tracing::warn!(
                "Log for {} returned {} commits (log_limit), the remainder of the window is left for the next cycle",
                repo.name,
                commits.len()
            );
            report.log_truncated = true;
        }

        let extractor = ChangeExtractor::new(runner, repo.local_path.clone(), self.filter.clone());
        let mut last_done: Option<&Commit> = None;
        let mut cancelled = false;
        for commit in &commits {
            if cancel.is_cancelled() {
                tracing::info!(
                    "Cycle for {} cancelled after {} of {} commits",
                    repo.name,
                    report.outcomes.len(),
                    commits.len()
                );
                cancelled = true;
                break;
            }
            let outcome = self.process_commit(repo, &extractor, commit).await;
            report.outcomes.push(outcome);
            last_done = Some(commit);
        }

        stage(repo, CycleStage::Checkpointing);
        let target: Option<(DateTime<Utc>, Option<String>)> = if cancelled {
            // Only as far as the work actually done; the last commit is re-fetched
            // next time and resolves as a duplicate
            last_done.map(|c| (c.date, Some(c.revision.clone())))
        } else if report.log_truncated {
            commits.last().map(|last| {
                if last.date > window.since {
                    (last.date, Some(last.revision.clone()))
                } else {
                    // Every fetched commit shares the window start: holding here would refetch forever
                    tracing::error!(
                        "More than {} commits of {} share {}, raise log_limit; skipping to {}",
                        limit,
                        repo.name,
                        window.since.to_rfc3339(),
                        window.until.to_rfc3339()
                    );
                    (window.until, Some(last.revision.clone()))
                }
            })
        } else {
            Some((window.until, commits.last().map(|c| c.revision.clone())))
        };
        if cancelled {
            report.status = RepositoryStatus::Cancelled;
        }

        if let Some((checked_until, revision)) = target {
            let checkpoints = self.checkpoints.clone();
            let name = repo.name.clone();
            let advanced = store::blocking(move || {
                checkpoints.advance_to(&name, revision.as_deref(), checked_until)
            })
            .await;
            match advanced {
                Ok(()) => report.checkpoint_advanced = true,
                Err(e) => {
                    tracing::error!("Failed to advance checkpoint for {}: {}", repo.name, e);
                    report = report.failed(e);
                }
            }
        }

        stage(repo, CycleStage::Idle);
        report
    }

    /// Sync the working copy and list the window's commits
    ///
    /// Either failure is recorded and yields no commits; the checkpoint still advances.
    async fn sync_and_fetch(
        &self,
        repo: &RepositoryConfig,
        runner: Arc<dyn SvnRunner>,
        window: Window,
        report: &mut RepositoryReport,
    ) -> Vec<Commit> {
        stage(repo, CycleStage::Syncing);
        let working_copy = WorkingCopyManager::new(runner.clone(), repo.remote_url.clone(), repo.local_path.clone());
        if let Err(e) = working_copy.sync().await {
            tracing::warn!("Sync of {} failed: {}", repo.name, e);
            report.sync_error = Some(e.to_string());
            return Vec::new();
        }

        stage(repo, CycleStage::Fetching);
        let fetcher = LogFetcher::new(runner, repo.remote_url.clone());
        match fetcher
            .try_list_commits(window.since, window.until, self.config.ingest.log_limit)
            .await
        {
            Ok(commits) => commits,
            Err(e) => {
                tracing::warn!("Log fetch for {} failed: {}", repo.name, e);
                report.fetch_error = Some(e.to_string());
                Vec::new()
            }
        }
    }

    /// Extract → classify → deduplicate → review → record → emit for one commit
    async fn process_commit(
        &self,
        repo: &RepositoryConfig,
        extractor: &ChangeExtractor,
        commit: &Commit,
    ) -> CommitOutcome {
        let revision = commit.revision.clone();
        let failed = |stage: CycleStage, error: String| {
            tracing::warn!("r{} of {} failed while {}: {}", commit.revision, repo.name, stage, error);
            CommitOutcome::Failed {
                revision: commit.revision.clone(),
                stage,
                error,
            }
        };

        stage(repo, CycleStage::Extracting);
        let changes = extractor.build_changes(commit).await;
        if changes.is_empty() {
            tracing::debug!("r{} has no reviewable changes", commit.revision);
            return CommitOutcome::NoChanges { revision };
        }

        stage(repo, CycleStage::Classifying);
        if self.classifier.should_skip_commit(repo, commit) {
            tracing::info!("Skipping merge commit r{} in {}", commit.revision, repo.name);
            return CommitOutcome::SkippedMerge { revision };
        }

        stage(repo, CycleStage::Deduplicating);
        let version_hash = fingerprint(std::slice::from_ref(commit), &changes);
        let versions = self.versions.clone();
        let (project, hash) = (repo.name.clone(), version_hash.clone());
        match store::blocking(move || versions.lookup(&project, &hash)).await {
            Ok(Some(existing)) => {
                tracing::info!(
                    "r{} of {} already processed at {} (version {})",
                    commit.revision,
                    repo.name,
                    existing.created_at.to_rfc3339(),
                    &version_hash[..12]
                );
                return CommitOutcome::Duplicate {
                    revision,
                    version_hash,
                };
            }
            Ok(None) => {}
            Err(e) => return failed(CycleStage::Deduplicating, e.to_string()),
        }

        stage(repo, CycleStage::Delivering);
        let branch = branch_from_paths(changes.iter().map(|c| c.file_path.as_str()));
        let context = commit_context(repo, commit, &branch, &changes);
        let outcome = match self.reviewer.review(&changes, &context).await {
            Ok(outcome) => outcome,
            Err(e) => return failed(CycleStage::Delivering, format!("{:#}", e)),
        };

        let new_version = NewVersion {
            project_name: repo.name.clone(),
            commits: vec![commit.clone()],
            changes,
            author: commit.author.clone(),
            branch: branch.clone(),
            review_type: REVIEW_TYPE.to_string(),
            review_result: outcome.review_text.clone(),
            score: outcome.score,
        };
        let versions = self.versions.clone();
        let record = match store::blocking(move || versions.record(&new_version)).await {
            Ok(record) => record,
            Err(e) => return failed(CycleStage::Delivering, e.to_string()),
        };

        let event = ReviewCompleted {
            project: repo.name.clone(),
            author: commit.author.clone(),
            revision: commit.revision.clone(),
            score: outcome.score,
            review_text: outcome.review_text,
            version_hash: record.version_hash.clone(),
            branch,
            commit_message: commit.message.clone(),
            file_paths: record.file_paths.clone(),
        };
        if let Err(e) = self.emitter.emit(event).await {
            // The record stays; the review happened
            tracing::warn!("Failed to emit review event for r{}: {:#}", commit.revision, e);
        }

        tracing::info!(
            "Reviewed r{} of {} (score {}, {} files)",
            commit.revision,
            repo.name,
            outcome.score,
            record.file_paths.len()
        );
        CommitOutcome::Reviewed {
            revision,
            version_hash: record.version_hash,
            score: outcome.score,
        }
    }

    /// Delete version records past the configured retention
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let versions = self.versions.clone();
        let days = self.config.ingest.retention_days;
        store::blocking(move || versions.purge_older_than(days)).await
    }
}

fn stage(repo: &RepositoryConfig, stage: CycleStage) {
    tracing::debug!("[{}] stage: {}", repo.name, stage);
}

/// Human-readable header handed to the reviewer along with the diffs
fn commit_context(repo: &RepositoryConfig, commit: &Commit, branch: &str, changes: &[Change]) -> String {
    format!(
        "Repository: {}\nRevision: r{}\nAuthor: {}\nDate: {}\nBranch: {}\nFiles: {}\n\n{}",
        repo.name,
        commit.revision,
        commit.author,
        commit.date.to_rfc3339(),
        branch,
        changes.len(),
        commit.message.trim()
    )
}
