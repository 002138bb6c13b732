//! Fluent builder for `git` invocations.
//!
//! Every call runs with `-C <dir>` instead of changing the process directory,
//! captures both streams, and is bounded by a timeout.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::GIT_PULL_TIMEOUT;
use crate::core::UpdaterError;

/// Builder for a single `git` command.
///
/// # Examples
///
/// ```rust,no_run
/// use multi_updater::git::command_builder::GitCommand;
///
/// # async fn example() -> anyhow::Result<()> {
/// let head = GitCommand::rev_parse("HEAD")
///     .current_dir("/opt/updater")
///     .execute_stdout()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GitCommand {
    program: Option<PathBuf>,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
    timeout: Duration,
}

impl Default for GitCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            current_dir: None,
            // Parsed output must not be localized
            env_vars: vec![("LC_ALL".to_string(), "C".to_string())],
            timeout: GIT_PULL_TIMEOUT,
        }
    }
}

impl GitCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run this executable instead of the `git` found on `PATH`.
    pub fn program(mut self, program: Option<PathBuf>) -> Self {
        self.program = program;
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// The git subcommand, for error messages.
    fn operation(&self) -> String {
        self.args.first().cloned().unwrap_or_else(|| "unknown".to_string())
    }

    fn full_args(&self) -> Vec<String> {
        let mut full_args = Vec::with_capacity(self.args.len() + 2);
        if let Some(ref dir) = self.current_dir {
            full_args.push("-C".to_string());
            full_args.push(dir.display().to_string());
        }
        full_args.extend(self.args.iter().cloned());
        full_args
    }

    /// Run git and capture its output. A non-zero exit is a
    /// [`UpdaterError::GitCommandError`] carrying stderr (or stdout when
    /// stderr is empty).
    pub async fn execute(self) -> Result<GitCommandOutput> {
        let git = match self.program {
            Some(ref program) => program.clone(),
            None => which::which("git").map_err(|_| UpdaterError::GitNotFound)?,
        };
        let full_args = self.full_args();

        let mut cmd = Command::new(&git);
        cmd.args(&full_args)
            .envs(self.env_vars.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(target: "git", "git {}", full_args.join(" "));

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| UpdaterError::Timedout {
                operation: format!("git {}", self.operation()),
                seconds: self.timeout.as_secs(),
            })?
            .with_context(|| format!("Failed to execute git {}", full_args.join(" ")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            tracing::debug!(
                target: "git",
                "git {} exited with {:?}: {}",
                self.operation(),
                output.status.code(),
                stderr.trim()
            );
            return Err(UpdaterError::GitCommandError {
                operation: self.operation(),
                stderr: if stderr.trim().is_empty() {
                    stdout
                } else {
                    stderr
                },
            }
            .into());
        }

        tracing::trace!(target: "git", "{}{}", stdout.trim_end(), stderr.trim_end());
        Ok(GitCommandOutput {
            stdout,
            stderr,
        })
    }

    /// Execute the command and return only stdout as a trimmed string
    pub async fn execute_stdout(self) -> Result<String> {
        let output = self.execute().await?;
        Ok(output.stdout.trim().to_string())
    }
}

/// Output from a Git command
#[derive(Debug, Clone, Default)]
pub struct GitCommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitCommandOutput {
    /// Both streams, stdout first.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

impl GitCommand {
    pub fn rev_parse(ref_name: &str) -> Self {
        Self::new().args(["rev-parse", ref_name])
    }

    /// Fast-forward only pull of the tracked branch.
    pub fn pull_ff_only() -> Self {
        Self::new().args(["pull", "--ff-only"])
    }
}
