//! svn client invocation.
//!
//! Every remote or working-copy operation goes through [`SvnRunner`], so the
//! working-copy manager, log fetcher and change extractor can be driven by a scripted
//! runner in tests. [`SvnCli`] is the production implementation backed by the `svn`
//! command-line client.

use super::decode::decode_output;
use crate::config::RepositoryConfig;
use crate::error::SvnError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Certificate failures accepted for self-hosted servers
const TRUSTED_CERT_FAILURES: &str = "unknown-ca,cn-mismatch,expired,not-yet-valid,other";

/// Decoded result of one svn invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Best available description of a failure
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Trait for running svn subcommands
///
/// `args` are the subcommand and its operands only (e.g. `["update", "/wc"]`);
/// implementations add authentication and non-interactive flags themselves.
#[async_trait]
pub trait SvnRunner: Send + Sync {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<CommandOutput, SvnError>;
}

/// Builds a runner for one repository (credentials are per repository)
pub trait RunnerFactory: Send + Sync {
    fn for_repository(&self, repo: &RepositoryConfig) -> Arc<dyn SvnRunner>;
}

/// Username/password pair passed to the svn client
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// `svn` command-line client
#[derive(Debug, Clone)]
pub struct SvnCli {
    binary: PathBuf,
    timeout: Duration,
    credentials: Option<Credentials>,
}

impl SvnCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            credentials: None,
        }
    }

    /// Authenticate with the given username and optional password
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.credentials = username.map(|username| Credentials { username, password });
        self
    }

    /// Full argument list: subcommand args followed by global flags
    fn full_args(&self, args: &[String]) -> Vec<String> {
        let mut full: Vec<String> = args.to_vec();
        full.push("--non-interactive".to_string());
        full.push(format!("--trust-server-cert-failures={}", TRUSTED_CERT_FAILURES));

        if let Some(creds) = &self.credentials {
            full.push("--username".to_string());
            full.push(creds.username.clone());
            if let Some(password) = &creds.password {
                full.push("--password".to_string());
                full.push(password.clone());
            }
            full.push("--no-auth-cache".to_string());
        }

        full
    }

    /// Argument list safe for logging
    fn redacted(args: &[String]) -> String {
        let mut out = Vec::with_capacity(args.len());
        let mut hide_next = false;
        for arg in args {
            if hide_next {
                out.push("***");
                hide_next = false;
                continue;
            }
            hide_next = arg == "--password";
            out.push(arg.as_str());
        }
        out.join(" ")
    }
}

impl SvnCli {
    fn command(&self, full_args: &[String], cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Children outliving a timed-out future are killed
            .kill_on_drop(true)
            // Corruption detection matches English messages; LC_ALL overrides any host locale
            .env("LC_ALL", "C");
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl SvnRunner for SvnCli {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<CommandOutput, SvnError> {
        let full_args = self.full_args(args);
        let subcommand = args.first().cloned().unwrap_or_default();

        tracing::debug!(
            "Running {} {}",
            self.binary.display(),
            Self::redacted(&full_args)
        );

        let mut cmd = self.command(&full_args, cwd);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SvnError::SpawnFailed {
                    program: self.binary.display().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(
                    "svn {} timed out after {:?}, process killed",
                    subcommand,
                    self.timeout
                );
                return Err(SvnError::Timeout {
                    command: subcommand,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: decode_output(&output.stdout),
            stderr: decode_output(&output.stderr),
        })
    }
}

/// Creates [`SvnCli`] runners configured from the ingest settings
#[derive(Debug, Clone)]
pub struct SvnCliFactory {
    binary: PathBuf,
    timeout: Duration,
}

impl SvnCliFactory {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl RunnerFactory for SvnCliFactory {
    fn for_repository(&self, repo: &RepositoryConfig) -> Arc<dyn SvnRunner> {
        Arc::new(
            SvnCli::new(self.binary.clone(), self.timeout)
                .with_credentials(repo.username.clone(), repo.password.clone()),
        )
    }
}

/// Convenience for building owned argument vectors
pub(crate) fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
