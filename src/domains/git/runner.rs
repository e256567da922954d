use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Coarse classification of a failed git invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GitFailureKind {
    NotARepository,
    AccessDenied,
    Conflict,
    Generic,
}

impl fmt::Display for GitFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GitFailureKind::NotARepository => "not-a-repository",
            GitFailureKind::AccessDenied => "access-denied",
            GitFailureKind::Conflict => "conflict",
            GitFailureKind::Generic => "generic",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GitCommandError {
    #[error("git {kind} failure (exit {exit_code:?}): {message}")]
    Failed {
        kind: GitFailureKind,
        message: String,
        exit_code: Option<i32>,
    },
    #[error("{step} timed out after {after:?}")]
    TimedOut { step: String, after: Duration },
    #[error("failed to spawn git: {message}")]
    Spawn { message: String },
}

impl GitCommandError {
    pub fn kind(&self) -> Option<GitFailureKind> {
        match self {
            GitCommandError::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stderr if present, stdout otherwise.
    pub fn combined_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Turns a non-zero exit into a classified error.
    pub fn into_result(self) -> Result<GitOutput, GitCommandError> {
        if self.success() {
            return Ok(self);
        }
        let message = self.combined_message();
        Err(GitCommandError::Failed {
            kind: classify_failure(&message),
            message,
            exit_code: self.exit_code,
        })
    }
}

/// Executes git subprocesses. Non-zero exits are returned as data; only
/// spawn failures and timeouts are errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(
        &self,
        cwd: &Path,
        args: &[String],
        limit: Duration,
    ) -> Result<GitOutput, GitCommandError>;
}

/// Runs the system `git` binary.
#[derive(Debug, Default, Clone)]
pub struct CliGitRunner;

impl CliGitRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GitRunner for CliGitRunner {
    async fn run(
        &self,
        cwd: &Path,
        args: &[String],
        limit: Duration,
    ) -> Result<GitOutput, GitCommandError> {
        debug!("running git {args:?} in {}", cwd.display());

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let step = step_label(args);
        let output = match timeout(limit, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(GitCommandError::Spawn {
                    message: format!("{step}: {e}"),
                })
            }
            Err(_) => {
                warn!("{step} timed out after {limit:?} in {}", cwd.display());
                return Err(GitCommandError::TimedOut { step, after: limit });
            }
        };

        let result = GitOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !result.success() {
            debug!(
                "{step} exited with {:?}: {}",
                result.exit_code,
                result.combined_message()
            );
        }

        Ok(result)
    }
}

pub fn step_label(args: &[String]) -> String {
    match args.first() {
        Some(sub) => format!("git {sub}"),
        None => "git".to_string(),
    }
}

pub fn classify_failure(message: &str) -> GitFailureKind {
    let normalized = message.to_lowercase();

    if normalized.contains("not a git repository") {
        return GitFailureKind::NotARepository;
    }

    const ACCESS_MARKERS: &[&str] = &[
        "permission denied",
        "access denied",
        "authentication failed",
        "could not read username",
        "could not read password",
        "denied by",
        "the requested url returned error: 403",
    ];
    if ACCESS_MARKERS.iter().any(|marker| normalized.contains(marker)) {
        return GitFailureKind::AccessDenied;
    }

    const CONFLICT_MARKERS: &[&str] = &[
        "conflict",
        "could not apply",
        "unmerged",
        "needs merge",
        "fix conflicts",
    ];
    if CONFLICT_MARKERS.iter().any(|marker| normalized.contains(marker)) {
        return GitFailureKind::Conflict;
    }

    GitFailureKind::Generic
}

/// Builds an owned argument vector from string slices.
pub fn git_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter().map(|a| a.as_ref().to_string()).collect()
}
