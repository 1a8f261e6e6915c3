//! Commit log fetching and `svn log --xml` parsing.

use super::command::{SvnRunner, args};
use crate::error::SvnError;
use crate::types::{ChangedPath, Commit, PathAction, Window};
use chrono::{DateTime, Duration, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::sync::Arc;

/// Queries one remote repository for the commits of a polling window
pub struct LogFetcher {
    runner: Arc<dyn SvnRunner>,
    remote_url: String,
}

impl LogFetcher {
    pub fn new(runner: Arc<dyn SvnRunner>, remote_url: impl Into<String>) -> Self {
        Self {
            runner,
            remote_url: remote_url.into(),
        }
    }

    /// List commits in `[since, until)`, logging and returning an empty list on failure
    ///
    /// A failure here must never abort the rest of the batch, so errors are not
    /// propagated. Use [`LogFetcher::try_list_commits`] to tell a failed fetch apart
    /// from an empty window.
    pub async fn list_commits(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Commit> {
        match self.try_list_commits(since, until, limit).await {
            Ok(commits) => commits,
            Err(e) => {
                tracing::warn!("Log query for {} failed: {}", self.remote_url, e);
                Vec::new()
            }
        }
    }

    /// List commits in `[since, until)`, oldest first, capped at `limit`
    ///
    /// A result of exactly `limit` commits may have been cut short; the caller must
    /// not treat the whole window as seen in that case.
    pub async fn try_list_commits(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Commit>, SvnError> {
        let window = Window { since, until };
        // svn date revisions have second precision; widen the query and filter exactly below
        let range = format!(
            "{{{}}}:{{{}}}",
            since.format("%Y-%m-%dT%H:%M:%SZ"),
            (until + Duration::seconds(1)).format("%Y-%m-%dT%H:%M:%SZ")
        );
        // The revision in effect at `since` predates the window but still takes a slot
        let limit_arg = (limit + 1).to_string();

        let output = self
            .runner
            .run(
                &args([
                    "log",
                    "--xml",
                    "-v",
                    "-r",
                    range.as_str(),
                    "-l",
                    limit_arg.as_str(),
                    self.remote_url.as_str(),
                ]),
                None,
            )
            .await
            .map_err(|e| SvnError::LogFetchFailed(e.to_string()))?;

        if !output.success {
            return Err(SvnError::LogFetchFailed(output.error_text()));
        }

        let commits: Vec<Commit> = parse_log_xml(&output.stdout)?
            .into_iter()
            .filter(|c| window.contains(c.date))
            .take(limit)
            .collect();

        tracing::info!(
            "Fetched {} commits from {} in [{}, {})",
            commits.len(),
            self.remote_url,
            since.to_rfc3339(),
            until.to_rfc3339()
        );
        Ok(commits)
    }
}

/// Element whose text is currently being collected
enum Field {
    Author,
    Date,
    Msg,
    Path {
        action: Option<String>,
        kind: Option<String>,
        prop_mods: bool,
        text_mods: bool,
    },
}

#[derive(Default)]
struct PartialEntry {
    revision: String,
    author: Option<String>,
    date: Option<String>,
    message: Option<String>,
    paths: Vec<ChangedPath>,
}

impl PartialEntry {
    fn into_commit(self) -> Option<Commit> {
        let Some(raw_date) = self.date else {
            tracing::debug!("Skipping r{} without a date", self.revision);
            return None;
        };
        let date = match DateTime::parse_from_rfc3339(raw_date.trim()) {
            Ok(date) => date.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!("Skipping r{} with bad date '{}': {}", self.revision, raw_date, e);
                return None;
            }
        };

        Some(Commit {
            revision: self.revision,
            author: self
                .author
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            date,
            message: self.message.unwrap_or_default(),
            paths: self.paths,
        })
    }
}

fn parse_err(e: impl std::fmt::Display) -> SvnError {
    SvnError::LogParseFailed(e.to_string())
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, SvnError> {
    match e.try_get_attribute(name).map_err(parse_err)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(parse_err)?.into_owned())),
        None => Ok(None),
    }
}

fn path_field(e: &BytesStart<'_>) -> Result<Field, SvnError> {
    Ok(Field::Path {
        action: attribute(e, "action")?,
        kind: attribute(e, "kind")?,
        prop_mods: attribute(e, "prop-mods")?.as_deref() == Some("true"),
        text_mods: attribute(e, "text-mods")?.as_deref() != Some("false"),
    })
}

/// Parse the output of `svn log --xml -v`
///
/// Entries keep the order of the document. An entry without a date is skipped; a
/// missing author becomes `"unknown"` and a missing message an empty string.
pub fn parse_log_xml(xml: &str) -> Result<Vec<Commit>, SvnError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut commits = Vec::new();
    let mut entry: Option<PartialEntry> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(parse_err)? {
            Event::Start(e) => {
                text.clear();
                match e.name().as_ref() {
                    b"logentry" => {
                        entry = Some(PartialEntry {
                            revision: attribute(&e, "revision")?.unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                    b"author" => field = Some(Field::Author),
                    b"date" => field = Some(Field::Date),
                    b"msg" => field = Some(Field::Msg),
                    b"path" => field = Some(path_field(&e)?),
                    _ => {}
                }
            }
            Event::Text(e) => {
                if field.is_some() {
                    text.push_str(&e.unescape().map_err(parse_err)?);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"logentry" => {
                    if let Some(commit) = entry.take().and_then(PartialEntry::into_commit) {
                        commits.push(commit);
                    }
                }
                b"author" | b"date" | b"msg" | b"path" => {
                    let value = std::mem::take(&mut text);
                    if let (Some(current), Some(done)) = (entry.as_mut(), field.take()) {
                        match done {
                            Field::Author => current.author = Some(value),
                            Field::Date => current.date = Some(value),
                            Field::Msg => current.message = Some(value),
                            Field::Path {
                                action,
                                kind,
                                prop_mods,
                                text_mods,
                            } => match action.as_deref().and_then(PathAction::from_svn_code) {
                                Some(action) => current.paths.push(ChangedPath {
                                    path: value,
                                    action,
                                    kind,
                                    prop_mods,
                                    text_mods,
                                }),
                                None => tracing::debug!(
                                    "Ignoring path '{}' with unknown action {:?}",
                                    value,
                                    action
                                ),
                            },
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if entry.is_some() {
        return Err(SvnError::LogParseFailed(
            "document ended inside a logentry".to_string(),
        ));
    }

    Ok(commits)
}
