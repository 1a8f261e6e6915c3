//! Per-file diff extraction for a commit.

use super::command::{SvnRunner, args};
use crate::error::SvnError;
use crate::types::{Change, ChangedPath, Commit, PathAction};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Case-insensitive allow-list of reviewable file extensions
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    /// Normalizes entries to a lowercase, dot-prefixed form (`"PY"` and `".py"` both become `.py`)
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut extensions: Vec<String> = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| format!(".{}", e))
            .collect();
        extensions.sort();
        extensions.dedup();
        Self { extensions }
    }

    pub fn accepts(&self, path: &str) -> bool {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        match file_name.rfind('.') {
            // A leading dot alone (".gitignore") is not an extension
            Some(idx) if idx > 0 => {
                let ext = file_name[idx..].to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }
}

/// Count added and removed lines of a unified diff, ignoring file headers
pub fn count_diff_lines(diff: &str) -> (usize, usize) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in diff.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            additions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            deletions += 1;
        }
    }
    (additions, deletions)
}

/// Unified diff for a newly added file: every line of the content as an addition
pub fn synthesize_added_diff(path: &str, content: &str) -> String {
    let mut diff = format!("--- /dev/null\n+++ {}\n", path);
    for line in content.lines() {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

/// Builds reviewable [`Change`]s from the changed paths of a commit
pub struct ChangeExtractor {
    runner: Arc<dyn SvnRunner>,
    working_copy: PathBuf,
    filter: ExtensionFilter,
}

impl ChangeExtractor {
    pub fn new(
        runner: Arc<dyn SvnRunner>,
        working_copy: impl Into<PathBuf>,
        filter: ExtensionFilter,
    ) -> Self {
        Self {
            runner,
            working_copy: working_copy.into(),
            filter,
        }
    }

    fn working_copy(&self) -> &Path {
        &self.working_copy
    }

    /// Diff every reviewable file of the commit
    ///
    /// Deleted entries, directories and files outside the extension allow-list are
    /// skipped. A file whose content cannot be fetched is logged and left out; the
    /// remaining files are still returned.
    pub async fn build_changes(&self, commit: &Commit) -> Vec<Change> {
        let mut changes = Vec::new();

        for entry in &commit.paths {
            if entry.action == PathAction::Deleted || entry.is_dir() {
                continue;
            }
            if !self.filter.accepts(&entry.path) {
                tracing::debug!("Skipping {} (extension not reviewable)", entry.path);
                continue;
            }

            match self.change_for(entry, &commit.revision).await {
                Ok(change) => changes.push(change),
                Err(e) => {
                    tracing::warn!("Skipping {} in r{}: {}", entry.path, commit.revision, e);
                }
            }
        }

        tracing::debug!(
            "Built {} changes for r{} ({} paths)",
            changes.len(),
            commit.revision,
            commit.paths.len()
        );
        changes
    }

    async fn change_for(&self, entry: &ChangedPath, revision: &str) -> Result<Change, SvnError> {
        let diff_text = match entry.action {
            PathAction::Added => {
                let content = self.fetch(&entry.path, revision, &["cat"]).await?;
                synthesize_added_diff(&entry.path, &content)
            }
            _ => {
                let previous = previous_revision(revision).map_err(|e| SvnError::DiffFetchFailed {
                    path: entry.path.clone(),
                    revision: revision.to_string(),
                    reason: e.to_string(),
                })?;
                let range = format!("{}:{}", previous, revision);
                self.fetch(&entry.path, revision, &["diff", "-r", range.as_str()])
                    .await?
            }
        };

        let (additions, deletions) = count_diff_lines(&diff_text);
        Ok(Change {
            file_path: entry.path.clone(),
            diff_text,
            action: entry.action,
            additions,
            deletions,
        })
    }

    /// Run `svn <subcommand...> ^/<path>@<rev>` inside the working copy
    async fn fetch(&self, path: &str, revision: &str, subcommand: &[&str]) -> Result<String, SvnError> {
        let target = format!("^/{}@{}", path.trim_start_matches('/'), revision);
        let mut argv = args(subcommand.iter().copied());
        argv.push(target);

        let output = self
            .runner
            .run(&argv, Some(self.working_copy()))
            .await
            .map_err(|e| SvnError::DiffFetchFailed {
                path: path.to_string(),
                revision: revision.to_string(),
                reason: e.to_string(),
            })?;

        if !output.success {
            return Err(SvnError::DiffFetchFailed {
                path: path.to_string(),
                revision: revision.to_string(),
                reason: output.error_text(),
            });
        }
        Ok(output.stdout)
    }
}

fn previous_revision(revision: &str) -> Result<u64, SvnError> {
    match revision.trim().parse::<u64>() {
        Ok(rev) if rev > 0 => Ok(rev - 1),
        _ => Err(SvnError::InvalidRevision(revision.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svn::command::CommandOutput;
    use crate::svn::testing::ScriptedRunner;
    use chrono::Utc;

    fn commit(revision: &str, paths: Vec<ChangedPath>) -> Commit {
        Commit {
            revision: revision.to_string(),
            author: "alice".to_string(),
            date: Utc::now(),
            message: "Fix payment bug".to_string(),
            paths,
        }
    }

    fn extractor(runner: Arc<ScriptedRunner>) -> ChangeExtractor {
        ChangeExtractor::new(runner, "/srv/mirror/payments", ExtensionFilter::new([".py", "java"]))
    }

    #[test]
    fn test_extension_filter_normalizes() {
        let filter = ExtensionFilter::new(["PY", ".Java", " .py ", ""]);
        assert_eq!(filter.extensions(), &[".java".to_string(), ".py".to_string()]);

        assert!(filter.accepts("/trunk/src/App.JAVA"));
        assert!(filter.accepts("/trunk/pay.py"));
        assert!(!filter.accepts("/trunk/README.md"));
        assert!(!filter.accepts("/trunk/.py"));
        assert!(!filter.accepts("/trunk/Makefile"));
        assert!(!filter.accepts("/trunk/py.dir/Makefile"));
    }

    #[test]
    fn test_count_diff_lines_ignores_headers() {
        let diff = "--- a/pay.py\n+++ b/pay.py\n@@ -1,2 +1,3 @@\n-old\n+new\n+more\n context\n";
        assert_eq!(count_diff_lines(diff), (2, 1));
        assert_eq!(count_diff_lines(""), (0, 0));
    }

    #[test]
    fn test_synthesize_added_diff() {
        let diff = synthesize_added_diff("/trunk/new.py", "import os\n\nprint(1)\n");
        assert_eq!(diff, "--- /dev/null\n+++ /trunk/new.py\n+import os\n+\n+print(1)\n");
        assert_eq!(count_diff_lines(&diff), (3, 0));
    }

    #[tokio::test]
    async fn test_build_changes_added_and_modified() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("cat", CommandOutput::ok("def pay():\n    return 1\n"));
        runner.push(
            "diff",
            CommandOutput::ok("--- pay.py\n+++ pay.py\n@@ -1 +1 @@\n-a = 1\n+a = 2\n"),
        );

        let changes = extractor(runner.clone())
            .build_changes(&commit(
                "500",
                vec![
                    ChangedPath::file("/trunk/new.py", PathAction::Added),
                    ChangedPath::file("/trunk/pay.py", PathAction::Modified),
                ],
            ))
            .await;

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].file_path, "/trunk/new.py");
        assert_eq!(changes[0].action, PathAction::Added);
        assert_eq!((changes[0].additions, changes[0].deletions), (2, 0));
        assert!(changes[0].diff_text.starts_with("--- /dev/null\n+++ /trunk/new.py\n"));
        assert_eq!((changes[1].additions, changes[1].deletions), (1, 1));

        assert_eq!(runner.calls_to("cat")[0], args(["cat", "^/trunk/new.py@500"]));
        assert_eq!(
            runner.calls_to("diff")[0],
            args(["diff", "-r", "499:500", "^/trunk/pay.py@500"])
        );
    }

    #[tokio::test]
    async fn test_one_failing_file_does_not_abort_others() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("diff", CommandOutput::failed("svn: E160013: path not found"));
        runner.push("diff", CommandOutput::ok("-x\n+y\n"));

        let changes = extractor(runner)
            .build_changes(&commit(
                "42",
                vec![
                    ChangedPath::file("/trunk/gone.py", PathAction::Modified),
                    ChangedPath::file("/trunk/ok.py", PathAction::Modified),
                ],
            ))
            .await;

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file_path, "/trunk/ok.py");
    }

    #[tokio::test]
    async fn test_skips_deleted_dirs_and_unlisted_extensions() {
        let runner = Arc::new(ScriptedRunner::new());
        let dir = ChangedPath {
            path: "/trunk".to_string(),
            action: PathAction::Modified,
            kind: Some("dir".to_string()),
            prop_mods: true,
            text_mods: false,
        };

        let changes = extractor(runner.clone())
            .build_changes(&commit(
                "7",
                vec![
                    dir,
                    ChangedPath::file("/trunk/old.py", PathAction::Deleted),
                    ChangedPath::file("/trunk/notes.txt", PathAction::Modified),
                ],
            ))
            .await;

        assert!(changes.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_numeric_revision_fails_modified_file_only() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push("cat", CommandOutput::ok("x = 1\n"));

        let changes = extractor(runner.clone())
            .build_changes(&commit(
                "HEAD",
                vec![
                    ChangedPath::file("/trunk/pay.py", PathAction::Modified),
                    ChangedPath::file("/trunk/new.py", PathAction::Added),
                ],
            ))
            .await;

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, PathAction::Added);
        assert!(runner.calls_to("diff").is_empty());
    }

    #[test]
    fn test_previous_revision() {
        assert_eq!(previous_revision("500").unwrap(), 499);
        assert!(previous_revision("0").is_err());
        assert!(previous_revision("abc").is_err());
    }
}
