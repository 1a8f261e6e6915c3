//! # revfeed - Incremental SVN Commit Ingestion
//!
//! Polls a set of Subversion repositories on a schedule and feeds every new commit
//! to a code reviewer exactly once.
//!
//! ## Overview
//!
//! Each poll cycle keeps a local working copy per repository in sync (repairing it
//! when an interrupted operation left it corrupted), lists the commits of a
//! checkpointed time window, turns their changed files into unified diffs, drops merge
//! commits for repositories that opted out of reviewing them, and deduplicates the
//! remaining change-sets by content fingerprint before handing them to the reviewer.
//!
//! ## Architecture
//!
//! ```text
//!          poll cycle (every N seconds)
//!                   │
//!          ┌────────▼────────┐
//!          │    Ingestor     │  one repository lock per cycle
//!          └────────┬────────┘
//!                   │
//!   ┌───────────────┼──────────────────┬─────────────────┐
//!   │               │                  │                 │
//! ┌─▼────────────┐ ┌▼───────────┐ ┌────▼──────────┐ ┌────▼──────────┐
//! │WorkingCopy   │ │LogFetcher  │ │ChangeExtractor│ │MergeClassifier│
//! │(sync+repair) │ │(svn log)   │ │(svn diff/cat) │ │(heuristics)   │
//! └──────────────┘ └────────────┘ └───────────────┘ └───────────────┘
//!                   │
//!          ┌────────▼────────┐     ┌──────────────┐
//!          │ SQLite store    │     │ Reviewer /   │
//!          │ checkpoints +   │     │ EventEmitter │
//!          │ version tracker │     └──────────────┘
//!          └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ingest`]: Poll cycle orchestration and per-repository locking
//! - [`svn`]: svn client wrapper, log parsing, diff extraction, working-copy recovery
//! - [`store`]: Checkpoint and version-tracker tables in one SQLite file
//! - [`merge`]: Merge-commit detection
//! - [`review`]: Reviewer and event emitter boundaries
//! - [`config`]: Configuration management with environment variable support
//! - [`types`]: Shared data model
//! - [`error`]: Error types
//! - [`paths`]: Platform-specific data and config locations
//!
//! ## Usage Example
//!
//! ```no_run
//! use revfeed::config::Config;
//! use revfeed::ingest::Ingestor;
//! use revfeed::review::{CommandReviewer, TracingEmitter};
//! use revfeed::store::Database;
//! use revfeed::svn::SvnCliFactory;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let database = Database::open(&config.store.db_path)?;
//!     let runners = Arc::new(SvnCliFactory::new(
//!         config.ingest.svn_binary.clone(),
//!         Duration::from_secs(config.ingest.command_timeout_secs),
//!     ));
//!     let reviewer = Arc::new(CommandReviewer::new("review-bot", vec![], Duration::from_secs(300)));
//!
//!     let ingestor = Ingestor::new(config, database, runners, reviewer, Arc::new(TracingEmitter))?;
//!     let report = ingestor.run_cycle(&CancellationToken::new()).await;
//!     println!("{} commits reviewed", report.reviewed());
//!     Ok(())
//! }
//! ```

/// Configuration management with environment variable overrides
pub mod config;

/// Error types and utilities
pub mod error;

/// Poll cycle orchestration
pub mod ingest;

/// Merge-commit detection heuristics
pub mod merge;

/// Platform-specific data and config locations
pub mod paths;

/// Reviewer and event emitter boundaries
pub mod review;

/// SQLite-backed checkpoint and version stores
pub mod store;

/// svn client wrapper and working-copy management
pub mod svn;

/// Shared data model
pub mod types;
