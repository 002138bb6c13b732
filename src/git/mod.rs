//! Git working copy access for the pull-based update path.
//!
//! The install root is a working copy when it contains `.git`. Updating it is
//! a fast-forward pull; whether anything changed is decided by comparing
//! `HEAD` before and after, with a keyword heuristic over the pull output as
//! a fallback when `HEAD` cannot be resolved.

pub mod command_builder;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use command_builder::{GitCommand, GitCommandOutput};

/// Result of a fast-forward pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub old_revision: Option<String>,
    pub new_revision: Option<String>,
    pub updated: bool,
}

/// A git working copy on disk.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    path: PathBuf,
    git: Option<PathBuf>,
}

impl WorkingCopy {
    /// The working copy rooted at `path`, if `path/.git` exists.
    pub fn open(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        is_working_copy(&path).then_some(Self {
            path,
            git: None,
        })
    }

    /// Use `program` as the git executable for every command.
    #[must_use]
    pub fn with_git(mut self, program: impl Into<PathBuf>) -> Self {
        self.git = Some(program.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self, base: GitCommand) -> GitCommand {
        base.program(self.git.clone()).current_dir(&self.path)
    }

    /// Resolved `HEAD` commit.
    pub async fn head_revision(&self) -> Result<String> {
        self.command(GitCommand::rev_parse("HEAD")).execute_stdout().await
    }

    /// A single `git pull --ff-only` attempt.
    pub async fn fast_forward(&self) -> Result<GitCommandOutput> {
        self.command(GitCommand::pull_ff_only()).execute().await
    }

    /// Compare the current `HEAD` against `old_revision`, falling back to
    /// the pull output when either side is unknown.
    pub async fn report_since(&self, old_revision: Option<String>, output: &GitCommandOutput) -> PullReport {
        let new_revision = self.head_revision().await.ok();

        let updated = match (&old_revision, &new_revision) {
            (Some(old), Some(new)) => old != new,
            _ => {
                warn!(target: "git", "Could not compare revisions, inspecting pull output");
                pull_output_indicates_update(&output.combined())
            }
        };

        debug!(target: "git", "Pull finished: {:?} -> {:?}, updated={}", old_revision, new_revision, updated);
        PullReport {
            old_revision,
            new_revision,
            updated,
        }
    }
}

pub fn is_working_copy(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Keyword heuristic over `git pull` output (run with `LC_ALL=C`).
///
/// An explicit "already up to date" wins. Anything unrecognised counts as
/// updated, so a caller never skips a needed restart.
pub fn pull_output_indicates_update(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("already up to date") || lower.contains("already up-to-date") {
        return false;
    }
    if ["fast-forward", "updating ", "files changed", "file changed"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return true;
    }
    debug!(target: "git", "Unrecognised pull output, assuming updated");
    true
}
