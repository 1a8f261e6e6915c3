/// Centralized error types for revfeed using thiserror
///
/// Only working-copy corruption is retried (through the recovery ladder, see
/// [`SvnError::is_corruption`]). Every other kind is logged by the orchestrator and
/// turned into "zero results" for that unit of work.
use thiserror::Error;

/// Main error type for the ingestion engine
#[derive(Error, Debug)]
pub enum RevfeedError {
    #[error("SVN error: {0}")]
    Svn(#[from] SvnError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while talking to the remote repository or the local working copy
#[derive(Error, Debug)]
pub enum SvnError {
    #[error("Checkout of '{url}' failed: {reason}")]
    CheckoutFailed { url: String, reason: String },

    #[error("Update of '{path}' failed: {reason}")]
    UpdateFailed { path: String, reason: String },

    #[error("Working copy '{path}' is corrupted: {reason}")]
    WorkingCopyCorrupted { path: String, reason: String },

    #[error("Failed to fetch log: {0}")]
    LogFetchFailed(String),

    #[error("Failed to parse log output: {0}")]
    LogParseFailed(String),

    #[error("Failed to fetch diff for '{path}' at r{revision}: {reason}")]
    DiffFetchFailed {
        path: String,
        revision: String,
        reason: String,
    },

    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("'svn {command}' timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("Invalid revision: {0}")]
    InvalidRevision(String),
}

/// Errors from the embedded state store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to serialize column '{column}': {reason}")]
    Serialization { column: String, reason: String },

    #[error("Invalid timestamp '{0}' in store")]
    InvalidTimestamp(String),

    #[error("Failed to create store directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Connection lock poisoned")]
    LockPoisoned,

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid repository configuration: {0}")]
    ConfigInvalid(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl SvnError {
    /// Whether this error should be handed to the working-copy recovery ladder
    pub fn is_corruption(&self) -> bool {
        matches!(self, SvnError::WorkingCopyCorrupted { .. })
    }
}

// Conversion from anyhow::Error to RevfeedError
impl From<anyhow::Error> for RevfeedError {
    fn from(err: anyhow::Error) -> Self {
        RevfeedError::Other(format!("{:#}", err))
    }
}
