//! Core data model shared by the fetcher, extractor, stores and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a commit did to one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathAction {
    Added,
    Modified,
    Deleted,
}

impl PathAction {
    /// Parse the single-letter action code used by `svn log -v`
    ///
    /// `R` (replaced) is treated as an addition: the previous content is gone and the
    /// new file is reviewed in full.
    pub fn from_svn_code(code: &str) -> Option<Self> {
        match code.trim() {
            "A" | "R" => Some(PathAction::Added),
            "M" => Some(PathAction::Modified),
            "D" => Some(PathAction::Deleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PathAction::Added => "added",
            PathAction::Modified => "modified",
            PathAction::Deleted => "deleted",
        }
    }
}

/// One path entry of a commit, as reported by the log query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    /// Repository-root relative path (e.g. `/trunk/src/app.py`)
    pub path: String,
    pub action: PathAction,
    /// Node kind (`file` / `dir`) when the server reports it
    #[serde(default)]
    pub kind: Option<String>,
    /// Whether properties changed on this node
    #[serde(default)]
    pub prop_mods: bool,
    /// Whether file content changed on this node
    #[serde(default)]
    pub text_mods: bool,
}

impl ChangedPath {
    /// Create a file entry with content modifications
    pub fn file(path: impl Into<String>, action: PathAction) -> Self {
        Self {
            path: path.into(),
            action,
            kind: Some("file".to_string()),
            prop_mods: false,
            text_mods: action != PathAction::Deleted,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.as_deref() == Some("dir")
    }
}

/// A commit fetched from the remote repository. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Revision number as reported by the server
    pub revision: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub paths: Vec<ChangedPath>,
}

/// A reviewable file-level change derived from a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub file_path: String,
    /// Unified diff text (synthesized for added files)
    pub diff_text: String,
    pub action: PathAction,
    pub additions: usize,
    pub deletions: usize,
}

/// Per-repository ingestion progress marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub repo_name: String,
    pub last_check_time: DateTime<Utc>,
    pub last_revision: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Half-open polling window `[since, until)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Window {
    /// Whether a timestamp falls inside the half-open interval
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.since && at < self.until
    }
}

/// A processed change-set recorded in the version tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub project_name: String,
    pub version_hash: String,
    pub commit_sha: String,
    pub author: String,
    pub branch: String,
    pub file_paths: Vec<String>,
    pub changes_hash: String,
    pub review_type: String,
    pub reviewed_at: DateTime<Utc>,
    pub review_result: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub commit_message: String,
    pub commit_date: String,
    pub additions_count: u64,
    pub deletions_count: u64,
    pub file_details: serde_json::Value,
}

/// Result returned by the reviewing collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub review_text: String,
    pub score: i64,
}

/// Event emitted after a review was recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCompleted {
    pub project: String,
    pub author: String,
    pub revision: String,
    pub score: i64,
    pub review_text: String,
    pub version_hash: String,
    pub branch: String,
    pub commit_message: String,
    pub file_paths: Vec<String>,
}

/// Derive the branch name from repository-root relative paths
///
/// Follows the conventional `trunk` / `branches/<name>` / `tags/<name>` layout and
/// reports the first recognisable location; anything else is `"unknown"`.
pub fn branch_from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    for path in paths {
        let mut parts = path.trim_start_matches('/').split('/');
        while let Some(part) = parts.next() {
            match part {
                "trunk" => return "trunk".to_string(),
                "branches" | "tags" => {
                    if let Some(name) = parts.next() {
                        return format!("{}/{}", part, name);
                    }
                }
                _ => {}
            }
        }
    }
    "unknown".to_string()
}
