//! Heuristic detection of merge/integration commits.
//!
//! Two modes: a message-only fast path ([`MergeClassifier::is_merge`]) and a weighted
//! multi-signal classifier ([`MergeClassifier::classify`]) driven by a rule table.
//! Neither is a proof; the threshold and the per-repository opt-out keep it tunable.

use crate::config::{MergeDetectionConfig, RepositoryConfig};
use crate::types::Commit;
use chrono::Timelike;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static MERGE_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^\s*merged?\b|\bauto-?merged?\b|\bautomerge\b|\bmerg(?:e|ed|ing)\s+(?:from|of|branch|trunk|r\d+|revision)\b|svn:mergeinfo|\bintegrat(?:e|ed|ion)\s+(?:r\d+|revision|branch|from)\b|合并)",
    )
    .expect("merge message pattern is valid")
});

/// Name fragments typical of build and CI service accounts
const AUTOMATION_TOKENS: &[&str] = &["ci", "bot", "svc", "deploy", "release"];
const AUTOMATION_FRAGMENTS: &[&str] = &["jenkins", "build", "automation"];

/// One weighted signal of the classifier
pub struct MergeRule {
    pub name: &'static str,
    pub weight: f64,
    /// Returns evidence when the rule fires
    pub check: fn(&MergeClassifier, &Commit) -> Option<serde_json::Value>,
}

/// Signals and weights, summed and clamped to `[0, 1]`
pub const RULES: &[MergeRule] = &[
    MergeRule {
        name: "message_pattern",
        weight: 0.4,
        check: message_pattern,
    },
    MergeRule {
        name: "file_count_outlier",
        weight: 0.3,
        check: file_count_outlier,
    },
    MergeRule {
        name: "mergeinfo_only",
        weight: 0.3,
        check: mergeinfo_only,
    },
    MergeRule {
        name: "automation_author",
        weight: 0.2,
        check: automation_author,
    },
    MergeRule {
        name: "off_hours",
        weight: 0.1,
        check: off_hours,
    },
];

fn message_pattern(_: &MergeClassifier, commit: &Commit) -> Option<serde_json::Value> {
    MERGE_MESSAGE
        .find(&commit.message)
        .map(|m| json!({ "matched": m.as_str() }))
}

fn file_count_outlier(classifier: &MergeClassifier, commit: &Commit) -> Option<serde_json::Value> {
    let threshold = classifier.config.file_count_threshold;
    (threshold > 0 && commit.paths.len() >= threshold)
        .then(|| json!({ "file_count": commit.paths.len(), "threshold": threshold }))
}

fn mergeinfo_only(_: &MergeClassifier, commit: &Commit) -> Option<serde_json::Value> {
    // svn:mergeinfo lands as a property-only change on a directory
    let dirs: Vec<&str> = commit
        .paths
        .iter()
        .filter(|p| p.is_dir() && p.prop_mods && !p.text_mods)
        .map(|p| p.path.as_str())
        .collect();
    (!dirs.is_empty()).then(|| json!({ "directories": dirs }))
}

fn automation_author(classifier: &MergeClassifier, commit: &Commit) -> Option<serde_json::Value> {
    let author = commit.author.to_lowercase();
    let listed = classifier
        .config
        .automation_authors
        .iter()
        .any(|a| a.to_lowercase() == author);

    let pattern = author
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|tok| !tok.is_empty())
        .any(|tok| {
            AUTOMATION_TOKENS.contains(&tok)
                || tok.ends_with("bot")
                || AUTOMATION_FRAGMENTS.iter().any(|f| tok.contains(f))
        });

    (listed || pattern).then(|| json!({ "author": commit.author, "configured": listed }))
}

fn off_hours(classifier: &MergeClassifier, commit: &Commit) -> Option<serde_json::Value> {
    let hour = commit.date.hour();
    let (start, end) = (classifier.config.off_hours_start, classifier.config.off_hours_end);
    let inside = if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    };
    inside.then(|| json!({ "hour_utc": hour }))
}

/// Outcome of the multi-signal classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeClassification {
    pub is_merge: bool,
    pub confidence: f64,
    pub signals: Vec<String>,
    pub evidence: BTreeMap<String, serde_json::Value>,
}

/// Merge-commit classifier
#[derive(Debug, Clone, Default)]
pub struct MergeClassifier {
    config: MergeDetectionConfig,
}

impl MergeClassifier {
    pub fn new(config: MergeDetectionConfig) -> Self {
        Self { config }
    }

    /// Fast path: does the message use merge or integration vocabulary?
    pub fn is_merge(&self, message: &str) -> bool {
        MERGE_MESSAGE.is_match(message)
    }

    /// Weighted classification over every rule in [`RULES`]
    pub fn classify(&self, commit: &Commit) -> MergeClassification {
        let mut total = 0.0;
        let mut signals = Vec::new();
        let mut evidence = BTreeMap::new();

        for rule in RULES {
            if let Some(found) = (rule.check)(self, commit) {
                total += rule.weight;
                signals.push(rule.name.to_string());
                evidence.insert(rule.name.to_string(), found);
            }
        }

        // Rounded so summed weights compare exactly against the threshold
        let confidence = ((total * 1e6).round() / 1e6).clamp(0.0, 1.0);
        MergeClassification {
            is_merge: confidence >= self.config.threshold,
            confidence,
            signals,
            evidence,
        }
    }

    /// Skip only when the repository opted out of merge review and the message looks like a merge
    pub fn should_skip(&self, repo: &RepositoryConfig, message: &str) -> bool {
        !repo.enable_merge_review && self.is_merge(message)
    }

    /// Skip decision for a full commit, using the enhanced classifier when enabled
    pub fn should_skip_commit(&self, repo: &RepositoryConfig, commit: &Commit) -> bool {
        if repo.enable_merge_review {
            return false;
        }
        if !self.config.enhanced {
            return self.is_merge(&commit.message);
        }

        let classification = self.classify(commit);
        if classification.is_merge {
            tracing::debug!(
                "r{} classified as merge (confidence {:.2}, signals {:?})",
                commit.revision,
                classification.confidence,
                classification.signals
            );
        }
        classification.is_merge
    }
}
