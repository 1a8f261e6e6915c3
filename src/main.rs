use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use revfeed::config::Config;
use revfeed::ingest::Ingestor;
use revfeed::merge::MergeClassifier;
use revfeed::review::{CommandReviewer, TracingEmitter};
use revfeed::store::{CheckpointStore, Database, VersionStore};
use revfeed::svn::SvnCliFactory;
use revfeed::types::{ChangedPath, Commit, PathAction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "revfeed")]
#[command(about = "Incremental SVN commit ingestion for code review")]
#[command(version, long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SOURCE_REVISION"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
))]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(short, long, env = "REVFEED_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one poll cycle and print the report as JSON
    Run,

    /// Poll continuously until interrupted
    Watch {
        /// Seconds between cycle starts
        #[arg(long, default_value = "300")]
        interval_secs: u64,
    },

    /// Print all checkpoints as JSON
    Checkpoints,

    /// Forget a repository's checkpoint so the next cycle starts from the default lookback
    ResetCheckpoint {
        /// Repository name
        name: String,
    },

    /// Delete version records older than the retention period
    Purge {
        /// Override the configured retention
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show how the merge classifier scores a commit
    Classify {
        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Commit author
        #[arg(short, long, default_value = "unknown")]
        author: String,

        /// Number of changed files
        #[arg(short, long, default_value = "1")]
        files: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            let ingestor = build_ingestor(config)?;
            let report = ingestor.run_cycle(&CancellationToken::new()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Watch { interval_secs } => {
            let ingestor = build_ingestor(config)?;
            watch(ingestor, Duration::from_secs(interval_secs.max(1))).await?;
        }
        Commands::Checkpoints => {
            let store = CheckpointStore::new(Database::open(&config.store.db_path)?)?;
            println!("{}", serde_json::to_string_pretty(&store.list_all()?)?);
        }
        Commands::ResetCheckpoint { name } => {
            let store = CheckpointStore::new(Database::open(&config.store.db_path)?)?;
            if store.reset(&name)? {
                println!("Checkpoint for {} reset", name);
            } else {
                println!("No checkpoint stored for {}", name);
            }
        }
        Commands::Purge { days } => {
            let store = VersionStore::new(Database::open(&config.store.db_path)?)?;
            let deleted = store.purge_older_than(days.unwrap_or(config.ingest.retention_days))?;
            println!("Deleted {} version records", deleted);
        }
        Commands::Classify {
            message,
            author,
            files,
        } => {
            let classifier = MergeClassifier::new(config.merge.clone());
            let commit = Commit {
                revision: "0".to_string(),
                author,
                date: chrono::Utc::now(),
                message,
                paths: (0..files)
                    .map(|i| ChangedPath::file(format!("/file{}", i), PathAction::Modified))
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&classifier.classify(&commit))?);
        }
    }

    Ok(())
}

fn build_ingestor(config: Config) -> Result<Ingestor> {
    if config.repositories.is_empty() {
        bail!("No repositories configured");
    }
    let reviewer = CommandReviewer::from_config(&config.review)
        .context("[review] command must be set to run poll cycles")?;
    let runners = SvnCliFactory::new(
        config.ingest.svn_binary.clone(),
        Duration::from_secs(config.ingest.command_timeout_secs),
    );
    let database = Database::open(&config.store.db_path)?;

    tracing::info!(
        "Polling {} repositories, state in {}",
        config.repositories.len(),
        config.store.db_path.display()
    );
    Ok(Ingestor::new(
        config,
        database,
        Arc::new(runners),
        Arc::new(reviewer),
        Arc::new(TracingEmitter),
    )?)
}

async fn watch(ingestor: Ingestor, interval: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current commit");
            on_signal.cancel();
        }
    });

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = ingestor.run_cycle(&cancel).await;
        match ingestor.purge_expired().await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!("Purged {} expired version records", deleted),
            Err(e) => tracing::warn!("Retention purge failed: {}", e),
        }
        tracing::info!(
            "Cycle done: {} reviewed, {} duplicates, {} failed",
            report.reviewed(),
            report.duplicates(),
            report.failures()
        );
    }

    Ok(())
}
