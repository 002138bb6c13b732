//! Command-line interface for multi-updater.
//!
//! Each subcommand lives in its own module with its own argument struct and
//! an `execute` method. Commands return the process exit status rather than
//! calling `std::process::exit` themselves, so `run` can pass the update
//! script's status through unchanged.
//!
//! # Available Commands
//!
//! - `check` - dry run of the update script, optionally with source checks
//! - `run` - real update run, streaming the script's output
//! - `sources` - query every package source in parallel
//! - `self-update` - check for or install a new release of this tool
//! - `backups` - list or prune installation backups
//! - `config` - show, create or locate the configuration file
//!
//! # Global Options
//!
//! - `--verbose` - debug logging on stderr
//! - `--quiet` - errors only
//! - `--log-file` - also append log events to a file
//! - `--config` - configuration file to use instead of the default
//! - `--no-progress` - disable progress bars and spinners
//!
//! # Example
//!
//! ```bash
//! # See what would be updated
//! multi-updater check --sources
//!
//! # Update, feeding the sudo password on stdin
//! secret-tool lookup app sudo | multi-updater run --password-stdin
//!
//! # Update this tool itself
//! multi-updater self-update
//! ```

mod backups;
mod check;
pub mod common;
mod config;
mod run;
mod self_update;
mod sources;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::GlobalConfig;
use crate::logging::LogConfig;

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Explicit configuration file, overriding the default location.
    pub config_path: Option<PathBuf>,

    /// Disable progress bars and spinners.
    pub no_progress: bool,
}

impl CliConfig {
    /// Load the configuration file this invocation points at.
    pub async fn load(&self) -> Result<GlobalConfig> {
        GlobalConfig::load_with_optional(self.config_path.clone()).await
    }
}

#[derive(Parser)]
#[command(
    name = "multi-updater",
    about = "Run the system update script and keep the updater itself current",
    version,
    author,
    long_about = "multi-updater supervises update-all.sh (system, AUR, Flatpak and app updates), \
                  streams its output and progress, and installs new releases of itself \
                  atomically with rollback."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Append log output to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH", env = "MULTI_UPDATER_CONFIG")]
    config: Option<PathBuf>,

    /// Disable progress bars and spinners
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry run: show what the update script would do
    Check(check::CheckCommand),

    /// Run the update script
    Run(run::RunCommand),

    /// Check every package source for pending updates
    Sources(sources::SourcesCommand),

    /// Update multi-updater itself
    SelfUpdate(self_update::SelfUpdateCommand),

    /// Manage installation backups
    Backups(backups::BackupsCommand),

    /// Manage the configuration file
    Config(config::ConfigCommand),
}

impl Cli {
    /// Logging setup requested by the global flags.
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig::from_flags(self.verbose, self.quiet, self.log_file.clone())
    }

    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        CliConfig {
            config_path: self.config.clone(),
            no_progress: self.no_progress || self.quiet,
        }
    }

    /// Run the selected command and return the process exit status.
    pub async fn execute(self) -> Result<i32> {
        let config = self.build_config();
        match self.command {
            Commands::Check(cmd) => cmd.execute(&config).await,
            Commands::Run(cmd) => cmd.execute(&config).await,
            Commands::Sources(cmd) => cmd.execute(&config).await,
            Commands::SelfUpdate(cmd) => cmd.execute(&config).await,
            Commands::Backups(cmd) => cmd.execute(&config).await,
            Commands::Config(cmd) => cmd.execute(&config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_reach_config() {
        let cli = Cli::parse_from([
            "multi-updater",
            "sources",
            "--no-progress",
            "--config",
            "/tmp/x.toml",
            "-v",
        ]);
        let config = cli.build_config();
        assert!(config.no_progress);
        assert_eq!(config.config_path, Some(PathBuf::from("/tmp/x.toml")));
        assert_eq!(cli.log_config().level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_quiet_disables_progress() {
        let cli = Cli::parse_from(["multi-updater", "-q", "check"]);
        assert!(cli.build_config().no_progress);
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["multi-updater", "-v", "-q", "check"]).is_err());
    }
}
