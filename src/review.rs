//! Boundary to the reviewing collaborator and downstream event consumers.

use crate::config::ReviewConfig;
use crate::types::{Change, ReviewCompleted, ReviewOutcome};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Turns a change-set into a review
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, changes: &[Change], commit_context: &str) -> Result<ReviewOutcome>;
}

/// Receives an event for every recorded review
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: ReviewCompleted) -> Result<()>;
}

#[derive(Serialize)]
struct ReviewRequest<'a> {
    commit_context: &'a str,
    changes: &'a [Change],
}

/// Reviewer backed by an external program
///
/// The program receives `{"commit_context": ..., "changes": [...]}` on stdin and must
/// print `{"review_text": ..., "score": ...}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReviewer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Build from the `[review]` section; `None` when no command is configured
    pub fn from_config(config: &ReviewConfig) -> Option<Self> {
        config.command.as_ref().map(|program| {
            Self::new(
                program.clone(),
                config.args.clone(),
                Duration::from_secs(config.timeout_secs),
            )
        })
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(&self, changes: &[Change], commit_context: &str) -> Result<ReviewOutcome> {
        let payload = serde_json::to_vec(&ReviewRequest {
            commit_context,
            changes,
        })
        .context("Failed to serialize review request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start review command '{}'", self.program))?;

        // Feed stdin concurrently so a chatty reviewer cannot block on a full pipe
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("Review command timed out after {:?}", self.timeout))?
            .context("Failed to wait for review command")?;

        if let Ok(Err(e)) = writer.await {
            tracing::debug!("Review command closed stdin early: {}", e);
        }

        if !output.status.success() {
            bail!(
                "Review command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let outcome: ReviewOutcome = serde_json::from_slice(&output.stdout)
            .context("Review command printed invalid JSON")?;
        Ok(outcome)
    }
}

/// Emits review events as structured log lines
#[derive(Debug, Clone, Default)]
pub struct TracingEmitter;

#[async_trait]
impl EventEmitter for TracingEmitter {
    async fn emit(&self, event: ReviewCompleted) -> Result<()> {
        tracing::info!(
            project = %event.project,
            revision = %event.revision,
            author = %event.author,
            branch = %event.branch,
            score = event.score,
            files = event.file_paths.len(),
            "Review completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PathAction;

    fn change() -> Change {
        Change {
            file_path: "/trunk/pay.py".to_string(),
            diff_text: "-a\n+b\n".to_string(),
            action: PathAction::Modified,
            additions: 1,
            deletions: 1,
        }
    }

    fn sh(script: &str, timeout: Duration) -> CommandReviewer {
        CommandReviewer::new("/bin/sh", vec!["-c".to_string(), script.to_string()], timeout)
    }

    #[test]
    fn test_from_config() {
        assert!(CommandReviewer::from_config(&ReviewConfig::default()).is_none());

        let config = ReviewConfig {
            command: Some("/usr/local/bin/review".to_string()),
            args: vec!["--json".to_string()],
            timeout_secs: 30,
        };
        let reviewer = CommandReviewer::from_config(&config).unwrap();
        assert_eq!(reviewer.timeout, Duration::from_secs(30));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reviewer_round_trip() {
        let reviewer = sh(
            r#"grep -q '"commit_context":"r500 by alice"' && echo '{"review_text":"LGTM","score":88}'"#,
            Duration::from_secs(10),
        );
        let outcome = reviewer.review(&[change()], "r500 by alice").await.unwrap();
        assert_eq!(outcome.review_text, "LGTM");
        assert_eq!(outcome.score, 88);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reviewer_failure() {
        let reviewer = sh("cat >/dev/null; echo boom >&2; exit 3", Duration::from_secs(10));
        let err = reviewer.review(&[change()], "ctx").await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let garbage = sh("cat >/dev/null; echo not-json", Duration::from_secs(10));
        assert!(garbage.review(&[change()], "ctx").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reviewer_timeout() {
        let reviewer = sh("sleep 5", Duration::from_millis(200));
        let err = reviewer.review(&[change()], "ctx").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_tracing_emitter_accepts_events() {
        let event = ReviewCompleted {
            project: "payments".to_string(),
            author: "alice".to_string(),
            revision: "500".to_string(),
            score: 88,
            review_text: "LGTM".to_string(),
            version_hash: "abc".to_string(),
            branch: "trunk".to_string(),
            commit_message: "Fix payment bug".to_string(),
            file_paths: vec!["/trunk/pay.py".to_string()],
        };
        assert!(TracingEmitter.emit(event).await.is_ok());
    }
}
