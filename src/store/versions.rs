//! Content-addressed record of processed change-sets (`version_tracker`).
//!
//! The fingerprint is what keeps a commit seen in two overlapping windows (or a
//! manual re-run) from being reviewed twice, so it must depend only on the logical
//! content of the change-set and never on iteration order or process state.

use super::{Database, format_ts, parse_ts};
use crate::error::StoreError;
use crate::types::{Change, Commit, VersionRecord};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS version_tracker (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_name TEXT NOT NULL,
    version_hash TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    author TEXT NOT NULL,
    branch TEXT NOT NULL,
    file_paths TEXT NOT NULL,
    changes_hash TEXT NOT NULL,
    review_type TEXT NOT NULL,
    reviewed_at TEXT NOT NULL,
    review_result TEXT NOT NULL,
    score INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    commit_message TEXT NOT NULL,
    commit_date TEXT NOT NULL,
    additions_count INTEGER NOT NULL DEFAULT 0,
    deletions_count INTEGER NOT NULL DEFAULT 0,
    file_details TEXT NOT NULL DEFAULT '[]',
    UNIQUE(project_name, version_hash)
);
CREATE INDEX IF NOT EXISTS idx_version_tracker_project_hash
    ON version_tracker(project_name, version_hash);
CREATE INDEX IF NOT EXISTS idx_version_tracker_created_at
    ON version_tracker(created_at);";

const COLUMNS: &str = "project_name, version_hash, commit_sha, author, branch, file_paths, \
     changes_hash, review_type, reviewed_at, review_result, score, created_at, commit_message, \
     commit_date, additions_count, deletions_count, file_details";

// Field order is part of the hash: keep these alphabetical
#[derive(Serialize)]
struct CanonicalCommit<'a> {
    author: &'a str,
    id: &'a str,
    message: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct CanonicalVersion<'a> {
    commits: Vec<CanonicalCommit<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<&'a str>>,
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Changes sorted by file path (stable for equal paths)
fn sorted_by_path(changes: &[Change]) -> Vec<&Change> {
    let mut sorted: Vec<&Change> = changes.iter().collect();
    sorted.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    sorted
}

/// SHA-256 over every change in file-path order
///
/// Each file contributes its path and its diff, both length-prefixed, so moving
/// bytes from one diff into the next changes the hash.
pub fn diff_hash(changes: &[Change]) -> String {
    let mut hasher = Sha256::new();
    for change in sorted_by_path(changes) {
        for field in [change.file_path.as_bytes(), change.diff_text.as_bytes()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Deterministic version hash of a change-set
///
/// Covers each commit's id, author, message and timestamp, and when `changes` is
/// non-empty, the sorted distinct file paths plus [`diff_hash`]. The canonical form is
/// compact JSON with a fixed field order, hashed with SHA-256.
pub fn fingerprint(commits: &[Commit], changes: &[Change]) -> String {
    let commits = commits
        .iter()
        .map(|c| CanonicalCommit {
            author: &c.author,
            id: &c.revision,
            message: &c.message,
            timestamp: c.date.to_rfc3339_opts(SecondsFormat::Micros, true),
        })
        .collect();

    let (diff_hash, files) = if changes.is_empty() {
        (None, None)
    } else {
        let mut files: Vec<&str> = changes.iter().map(|c| c.file_path.as_str()).collect();
        files.sort_unstable();
        files.dedup();
        (Some(diff_hash(changes)), Some(files))
    };

    let canonical = CanonicalVersion {
        commits,
        diff_hash,
        files,
    };
    // Serializing plain strings and vectors cannot fail
    let json = serde_json::to_string(&canonical).unwrap_or_default();
    sha256_hex(json.as_bytes())
}

/// Everything needed to record one reviewed change-set
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub project_name: String,
    pub commits: Vec<Commit>,
    pub changes: Vec<Change>,
    pub author: String,
    pub branch: String,
    pub review_type: String,
    pub review_result: String,
    pub score: i64,
}

#[derive(Serialize)]
struct FileDetail<'a> {
    path: &'a str,
    action: &'a str,
    additions: usize,
    deletions: usize,
}

impl NewVersion {
    fn commit_sha(&self) -> String {
        self.commits
            .iter()
            .map(|c| c.revision.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn commit_message(&self) -> String {
        self.commits
            .iter()
            .map(|c| c.message.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn commit_date(&self) -> String {
        self.commits
            .iter()
            .map(|c| c.date)
            .max()
            .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default()
    }

    fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.changes.iter().map(|c| c.file_path.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    fn file_details(&self) -> serde_json::Value {
        let details: Vec<FileDetail<'_>> = sorted_by_path(&self.changes)
            .into_iter()
            .map(|c| FileDetail {
                path: &c.file_path,
                action: c.action.as_str(),
                additions: c.additions,
                deletions: c.deletions,
            })
            .collect();
        serde_json::to_value(details).unwrap_or(serde_json::Value::Null)
    }
}

/// Data access object for version records
#[derive(Clone, Debug)]
pub struct VersionStore {
    db: Database,
}

impl VersionStore {
    /// Create the store, initializing its table if needed
    pub fn new(db: Database) -> Result<Self, StoreError> {
        let store = Self { db };
        store.init_schema()?;
        Ok(store)
    }

    /// Idempotent schema creation
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.db.with_connection(|conn| Ok(conn.execute_batch(SCHEMA)?))
    }

    /// Most recent record for a fingerprint, if this change-set was processed before
    pub fn lookup(&self, project_name: &str, version_hash: &str) -> Result<Option<VersionRecord>, StoreError> {
        self.db.with_connection(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM version_tracker
                         WHERE project_name = ?1 AND version_hash = ?2
                         ORDER BY created_at DESC LIMIT 1",
                        COLUMNS
                    ),
                    params![project_name, version_hash],
                    RawVersion::from_row,
                )
                .optional()?;
            raw.map(RawVersion::into_record).transpose()
        })
    }

    /// Upsert the record for this change-set
    ///
    /// Re-recording an existing fingerprint overwrites its review fields and keeps
    /// the original `created_at`.
    pub fn record(&self, version: &NewVersion) -> Result<VersionRecord, StoreError> {
        let version_hash = fingerprint(&version.commits, &version.changes);
        let file_paths = serde_json::to_string(&version.file_paths()).map_err(|e| {
            StoreError::Serialization {
                column: "file_paths".to_string(),
                reason: e.to_string(),
            }
        })?;
        let file_details = version.file_details().to_string();
        let additions: u64 = version.changes.iter().map(|c| c.additions as u64).sum();
        let deletions: u64 = version.changes.iter().map(|c| c.deletions as u64).sum();
        let now = format_ts(Utc::now());

        let record = self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO version_tracker (
                     project_name, version_hash, commit_sha, author, branch, file_paths,
                     changes_hash, review_type, reviewed_at, review_result, score, created_at,
                     commit_message, commit_date, additions_count, deletions_count, file_details
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?9, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(project_name, version_hash) DO UPDATE SET
                     commit_sha = excluded.commit_sha,
                     author = excluded.author,
                     branch = excluded.branch,
                     file_paths = excluded.file_paths,
                     changes_hash = excluded.changes_hash,
                     review_type = excluded.review_type,
                     reviewed_at = excluded.reviewed_at,
                     review_result = excluded.review_result,
                     score = excluded.score,
                     commit_message = excluded.commit_message,
                     commit_date = excluded.commit_date,
                     additions_count = excluded.additions_count,
                     deletions_count = excluded.deletions_count,
                     file_details = excluded.file_details",
                params![
                    version.project_name,
                    version_hash,
                    version.commit_sha(),
                    version.author,
                    version.branch,
                    file_paths,
                    diff_hash(&version.changes),
                    version.review_type,
                    now,
                    version.review_result,
                    version.score,
                    version.commit_message(),
                    version.commit_date(),
                    additions as i64,
                    deletions as i64,
                    file_details,
                ],
            )?;

            let raw = conn.query_row(
                &format!(
                    "SELECT {} FROM version_tracker WHERE project_name = ?1 AND version_hash = ?2",
                    COLUMNS
                ),
                params![version.project_name, version_hash],
                RawVersion::from_row,
            )?;
            raw.into_record()
        })?;

        tracing::debug!(
            "Recorded version {} for {} (r{})",
            record.version_hash,
            record.project_name,
            record.commit_sha
        );
        Ok(record)
    }

    /// Delete records created more than `days` days ago
    pub fn purge_older_than(&self, days: u32) -> Result<usize, StoreError> {
        self.purge_before(Utc::now() - Duration::days(i64::from(days)))
    }

    /// Delete records created strictly before `cutoff`
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = format_ts(cutoff);
        let deleted = self.db.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM version_tracker WHERE created_at < ?1",
                params![cutoff],
            )?)
        })?;
        if deleted > 0 {
            tracing::info!("Purged {} version records created before {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Number of records, optionally for one project
    pub fn count(&self, project_name: Option<&str>) -> Result<usize, StoreError> {
        self.db.with_connection(|conn| {
            let count: i64 = match project_name {
                Some(project) => conn.query_row(
                    "SELECT COUNT(*) FROM version_tracker WHERE project_name = ?1",
                    params![project],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM version_tracker", [], |row| row.get(0))?,
            };
            Ok(count.max(0) as usize)
        })
    }

    /// Newest records first
    pub fn recent(&self, project_name: Option<&str>, limit: usize) -> Result<Vec<VersionRecord>, StoreError> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM version_tracker
                 WHERE ?1 IS NULL OR project_name = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
                COLUMNS
            ))?;
            let raws = stmt
                .query_map(params![project_name, limit as i64], RawVersion::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(RawVersion::into_record).collect()
        })
    }
}

struct RawVersion {
    project_name: String,
    version_hash: String,
    commit_sha: String,
    author: String,
    branch: String,
    file_paths: String,
    changes_hash: String,
    review_type: String,
    reviewed_at: String,
    review_result: String,
    score: i64,
    created_at: String,
    commit_message: String,
    commit_date: String,
    additions_count: i64,
    deletions_count: i64,
    file_details: String,
}

impl RawVersion {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_name: row.get(0)?,
            version_hash: row.get(1)?,
            commit_sha: row.get(2)?,
            author: row.get(3)?,
            branch: row.get(4)?,
            file_paths: row.get(5)?,
            changes_hash: row.get(6)?,
            review_type: row.get(7)?,
            reviewed_at: row.get(8)?,
            review_result: row.get(9)?,
            score: row.get(10)?,
            created_at: row.get(11)?,
            commit_message: row.get(12)?,
            commit_date: row.get(13)?,
            additions_count: row.get(14)?,
            deletions_count: row.get(15)?,
            file_details: row.get(16)?,
        })
    }

    fn into_record(self) -> Result<VersionRecord, StoreError> {
        let file_paths = serde_json::from_str(&self.file_paths).map_err(|e| {
            StoreError::Serialization {
                column: "file_paths".to_string(),
                reason: e.to_string(),
            }
        })?;
        let file_details = serde_json::from_str(&self.file_details).map_err(|e| {
            StoreError::Serialization {
                column: "file_details".to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(VersionRecord {
            project_name: self.project_name,
            version_hash: self.version_hash,
            commit_sha: self.commit_sha,
            author: self.author,
            branch: self.branch,
            file_paths,
            changes_hash: self.changes_hash,
            review_type: self.review_type,
            reviewed_at: parse_ts(&self.reviewed_at)?,
            review_result: self.review_result,
            score: self.score,
            created_at: parse_ts(&self.created_at)?,
            commit_message: self.commit_message,
            commit_date: self.commit_date,
            additions_count: self.additions_count.max(0) as u64,
            deletions_count: self.deletions_count.max(0) as u64,
            file_details,
        })
    }
}
