/// Configuration system for revfeed
///
/// Supports loading from multiple sources with priority:
/// Environment variables > Config file > Defaults
use crate::error::{ConfigError, RevfeedError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Polling and command execution settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Merge-commit detection settings
    #[serde(default)]
    pub merge: MergeDetectionConfig,

    /// External reviewer settings
    #[serde(default)]
    pub review: ReviewConfig,

    /// Repositories polled on every cycle
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file holding `svn_checkpoints` and `version_tracker`
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory for per-repository advisory lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Lookback used for a repository that has never been polled
    #[serde(default = "default_lookback_hours")]
    pub default_lookback_hours: u32,

    /// File extensions whose changes are sent for review
    #[serde(default = "default_reviewable_extensions")]
    pub reviewable_extensions: Vec<String>,

    /// Maximum number of log entries fetched per window
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,

    /// Timeout for every svn invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Repositories processed in parallel within one cycle
    #[serde(default = "default_max_concurrent_repositories")]
    pub max_concurrent_repositories: usize,

    /// Age after which version records are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// svn client binary
    #[serde(default = "default_svn_binary")]
    pub svn_binary: String,

    /// How long to wait for another process holding a repository lock (0 = skip immediately)
    #[serde(default)]
    pub lock_timeout_secs: u64,
}

/// Merge-commit detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeDetectionConfig {
    /// Use the multi-signal classifier instead of the message-only fast path
    #[serde(default)]
    pub enhanced: bool,

    /// Confidence at or above which a commit counts as a merge
    #[serde(default = "default_merge_threshold")]
    pub threshold: f64,

    /// Number of touched paths considered an integration-sized commit
    #[serde(default = "default_file_count_threshold")]
    pub file_count_threshold: usize,

    /// Known build/CI service accounts
    #[serde(default = "default_automation_authors")]
    pub automation_authors: Vec<String>,

    /// Start of the off-hours window (UTC hour, inclusive)
    #[serde(default = "default_off_hours_start")]
    pub off_hours_start: u32,

    /// End of the off-hours window (UTC hour, exclusive)
    #[serde(default = "default_off_hours_end")]
    pub off_hours_end: u32,
}

/// External reviewer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Program that receives a change-set on stdin and prints a review as JSON
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments for the review program
    #[serde(default)]
    pub args: Vec<String>,

    /// Timeout for a single review
    #[serde(default = "default_review_timeout")]
    pub timeout_secs: u64,
}

/// One polled repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Unique name; also the checkpoint key and the project name of version records
    pub name: String,

    /// Remote repository URL (svn://, http(s)://, svn+ssh://, file://)
    pub remote_url: String,

    /// Local working copy location
    pub local_path: PathBuf,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Lookback override for the first poll
    #[serde(default)]
    pub check_hours: Option<u32>,

    /// When false, commits detected as merges are not reviewed
    #[serde(default = "default_enable_merge_review")]
    pub enable_merge_review: bool,
}

// Default value functions
fn default_db_path() -> PathBuf {
    crate::paths::PlatformPaths::default_db_path()
}

fn default_lock_dir() -> PathBuf {
    crate::paths::PlatformPaths::default_lock_dir()
}

fn default_lookback_hours() -> u32 {
    24
}

fn default_reviewable_extensions() -> Vec<String> {
    [
        ".py", ".java", ".js", ".ts", ".jsx", ".tsx", ".vue", ".go", ".rs", ".c", ".cc", ".cpp",
        ".h", ".hpp", ".cs", ".php", ".rb", ".kt", ".swift", ".scala", ".sql", ".sh", ".lua",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_log_limit() -> usize {
    100
}

fn default_command_timeout() -> u64 {
    600
}

fn default_max_concurrent_repositories() -> usize {
    4
}

fn default_retention_days() -> u32 {
    90
}

fn default_svn_binary() -> String {
    "svn".to_string()
}

fn default_merge_threshold() -> f64 {
    0.4
}

fn default_file_count_threshold() -> usize {
    15
}

fn default_automation_authors() -> Vec<String> {
    vec![
        "jenkins".to_string(),
        "buildbot".to_string(),
        "svc-build".to_string(),
        "ci".to_string(),
    ]
}

fn default_off_hours_start() -> u32 {
    22
}

fn default_off_hours_end() -> u32 {
    6
}

fn default_review_timeout() -> u64 {
    300
}

fn default_enable_merge_review() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            lock_dir: default_lock_dir(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_lookback_hours: default_lookback_hours(),
            reviewable_extensions: default_reviewable_extensions(),
            log_limit: default_log_limit(),
            command_timeout_secs: default_command_timeout(),
            max_concurrent_repositories: default_max_concurrent_repositories(),
            retention_days: default_retention_days(),
            svn_binary: default_svn_binary(),
            lock_timeout_secs: 0,
        }
    }
}

impl Default for MergeDetectionConfig {
    fn default() -> Self {
        Self {
            enhanced: false,
            threshold: default_merge_threshold(),
            file_count_threshold: default_file_count_threshold(),
            automation_authors: default_automation_authors(),
            off_hours_start: default_off_hours_start(),
            off_hours_end: default_off_hours_end(),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_review_timeout(),
        }
    }
}

impl RepositoryConfig {
    /// Create a repository entry with default options
    pub fn new(
        name: impl Into<String>,
        remote_url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            remote_url: remote_url.into(),
            local_path: local_path.into(),
            username: None,
            password: None,
            check_hours: None,
            enable_merge_review: default_enable_merge_review(),
        }
    }

    /// Lookback for a first poll, honouring the per-repository override
    pub fn lookback(&self, default_hours: u32) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.check_hours.unwrap_or(default_hours)))
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let key = |field: &str| format!("repositories[{}].{}", index, field);

        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key("name"),
                reason: "must not be empty".to_string(),
            });
        }

        if !self.remote_url.contains("://") {
            return Err(ConfigError::InvalidValue {
                key: key("remote_url"),
                reason: format!("'{}' is not a repository URL", self.remote_url),
            });
        }

        if self.local_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key("local_path"),
                reason: "must not be empty".to_string(),
            });
        }

        if self.check_hours == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: key("check_hours"),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Parse a repository list supplied as a JSON array
///
/// Entries are fully typed; anything malformed is rejected as a whole rather
/// than silently dropping repositories.
pub fn parse_repository_list(raw: &str) -> Result<Vec<RepositoryConfig>, ConfigError> {
    serde_json::from_str::<Vec<RepositoryConfig>>(raw)
        .map_err(|e| ConfigError::ConfigInvalid(format!("malformed repository list: {}", e)))
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self, RevfeedError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location or create default
    pub fn load_or_default() -> Result<Self, RevfeedError> {
        let config_path = crate::paths::PlatformPaths::default_config_path();

        if config_path.exists() {
            tracing::info!("Loading config from: {}", config_path.display());
            Self::from_file(&config_path)
        } else {
            tracing::info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), RevfeedError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::SaveFailed(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), RevfeedError> {
        if self.ingest.default_lookback_hours == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingest.default_lookback_hours".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if self.ingest.log_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingest.log_limit".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if self.ingest.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingest.command_timeout_secs".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if self.ingest.max_concurrent_repositories == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingest.max_concurrent_repositories".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if self.ingest.reviewable_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ingest.reviewable_extensions".to_string(),
                reason: "must list at least one extension".to_string(),
            }
            .into());
        }

        if !(0.0..=1.0).contains(&self.merge.threshold) {
            return Err(ConfigError::InvalidValue {
                key: "merge.threshold".to_string(),
                reason: format!("must be between 0.0 and 1.0, got {}", self.merge.threshold),
            }
            .into());
        }

        if self.merge.off_hours_start > 23 || self.merge.off_hours_end > 23 {
            return Err(ConfigError::InvalidValue {
                key: "merge.off_hours_start/off_hours_end".to_string(),
                reason: "hours must be between 0 and 23".to_string(),
            }
            .into());
        }

        let mut names = HashSet::new();
        for (index, repo) in self.repositories.iter().enumerate() {
            repo.validate(index)?;
            if !names.insert(repo.name.as_str()) {
                return Err(ConfigError::ConfigInvalid(format!(
                    "duplicate repository name '{}'",
                    repo.name
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), RevfeedError> {
        if let Ok(path) = std::env::var("REVFEED_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }

        if let Ok(hours) = std::env::var("REVFEED_LOOKBACK_HOURS")
            && let Ok(hours) = hours.parse()
        {
            self.ingest.default_lookback_hours = hours;
        }

        if let Ok(binary) = std::env::var("REVFEED_SVN_BINARY") {
            self.ingest.svn_binary = binary;
        }

        if let Ok(threshold) = std::env::var("REVFEED_MERGE_THRESHOLD")
            && let Ok(threshold) = threshold.parse()
        {
            self.merge.threshold = threshold;
        }

        if let Ok(raw) = std::env::var("REVFEED_REPOSITORIES") {
            self.repositories = parse_repository_list(&raw)?;
        }

        Ok(())
    }

    /// Load a config file (or defaults), apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self, RevfeedError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::load_or_default()?,
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a configured repository by name
    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_repo(name: &str) -> RepositoryConfig {
        RepositoryConfig::new(name, "https://svn.example.com/repo/trunk", "/tmp/wc")
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ingest.default_lookback_hours, 24);
        assert_eq!(config.ingest.log_limit, 100);
        assert_eq!(config.merge.threshold, 0.4);
        assert!(!config.merge.enhanced);
        assert!(config.repositories.is_empty());
        assert!(config.ingest.reviewable_extensions.contains(&".py".to_string()));
    }

    #[test]
    fn test_validate_valid_config() {
        let mut config = Config::default();
        config.repositories.push(sample_repo("payments"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_threshold() {
        let mut config = Config::default();
        config.merge.threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_log_limit() {
        let mut config = Config::default();
        config.ingest.log_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_repository_names() {
        let mut config = Config::default();
        config.repositories.push(sample_repo("payments"));
        config.repositories.push(sample_repo("payments"));

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            RevfeedError::Config(ConfigError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_url_without_scheme() {
        let mut config = Config::default();
        let mut repo = sample_repo("payments");
        repo.remote_url = "svn.example.com/repo".to_string();
        config.repositories.push(repo);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("repositories[0].remote_url"));
    }

    #[test]
    fn test_repository_lookback() {
        let mut repo = sample_repo("payments");
        assert_eq!(repo.lookback(24), chrono::Duration::hours(24));

        repo.check_hours = Some(6);
        assert_eq!(repo.lookback(24), chrono::Duration::hours(6));
    }

    #[test]
    fn test_parse_repository_list() {
        let raw = r#"[
            {"name": "payments", "remote_url": "svn://svn.example.com/payments", "local_path": "/wc/payments"},
            {"name": "ledger", "remote_url": "https://svn.example.com/ledger", "local_path": "/wc/ledger",
             "username": "reader", "password": "secret", "check_hours": 12, "enable_merge_review": false}
        ]"#;

        let repos = parse_repository_list(raw).unwrap();
        assert_eq!(repos.len(), 2);
        assert!(repos[0].enable_merge_review);
        assert_eq!(repos[1].check_hours, Some(12));
        assert!(!repos[1].enable_merge_review);
    }

    #[test]
    fn test_parse_malformed_repository_list() {
        let result = parse_repository_list("payments|svn://host/payments|/wc");
        assert!(matches!(result, Err(ConfigError::ConfigInvalid(_))));

        // Missing required field
        let result = parse_repository_list(r#"[{"name": "payments"}]"#);
        assert!(matches!(result, Err(ConfigError::ConfigInvalid(_))));
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = Config::default();
        config.ingest.log_limit = 250;
        config.merge.threshold = 0.6;
        config.repositories.push(sample_repo("payments"));

        config.save(path).unwrap();
        let loaded = Config::from_file(path).unwrap();

        assert_eq!(loaded.ingest.log_limit, 250);
        assert_eq!(loaded.merge.threshold, 0.6);
        assert_eq!(loaded.repositories, config.repositories);
    }

    #[test]
    fn test_load_minimal_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            r#"
[[repositories]]
name = "payments"
remote_url = "svn://svn.example.com/payments/trunk"
local_path = "/var/lib/revfeed/payments"
enable_merge_review = false
"#,
        )
        .unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config.repositories.len(), 1);
        assert!(!config.repositories[0].enable_merge_review);
        assert_eq!(config.ingest.default_lookback_hours, 24);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::from_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(
            result.unwrap_err(),
            RevfeedError::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_apply_env_overrides() {
        // Safety: these variables are only touched by this test
        unsafe {
            std::env::set_var("REVFEED_SVN_BINARY", "/opt/svn/bin/svn");
            std::env::set_var("REVFEED_MERGE_THRESHOLD", "0.55");
            std::env::set_var(
                "REVFEED_REPOSITORIES",
                r#"[{"name": "env-repo", "remote_url": "svn://host/env", "local_path": "/wc/env"}]"#,
            );
        }

        let mut config = Config::default();
        let result = config.apply_env_overrides();

        unsafe {
            std::env::remove_var("REVFEED_SVN_BINARY");
            std::env::remove_var("REVFEED_MERGE_THRESHOLD");
            std::env::remove_var("REVFEED_REPOSITORIES");
        }

        result.unwrap();
        assert_eq!(config.ingest.svn_binary, "/opt/svn/bin/svn");
        assert_eq!(config.merge.threshold, 0.55);
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.repositories[0].name, "env-repo");
    }
}
