use anyhow::Result;
use clap::Args;
use colored::Colorize;
use tracing::{debug, info};

use super::CliConfig;
use super::common::{notify_if_outdated, read_credential, show_progress, stream_session};
use crate::runner::{ProcessSupervisor, RunMode, SupervisorConfig};

/// Run the update script for real.
///
/// The exit status of this command is the script's own.
#[derive(Args, Debug)]
pub struct RunCommand {
    /// Ask before updating each component
    #[arg(long, conflicts_with = "password_stdin")]
    interactive: bool,

    /// Read the sudo password as one line from stdin
    #[arg(long)]
    password_stdin: bool,
}

impl RunCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<i32> {
        let config = cli.load().await?;
        notify_if_outdated(&config).await;
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_global(&config)?);

        // Before the credential is read, so a missing script fails fast
        supervisor.preflight()?;

        let credential = if self.password_stdin {
            Some(read_credential().await?)
        } else {
            None
        };
        let mode = if self.interactive {
            RunMode::Interactive
        } else {
            RunMode::Real
        };

        let session = supervisor.start(mode, credential).await?;
        info!(target: "cli", "Update script started (pid {:?})", session.pid());
        debug!(target: "cli", "argv: {:?}", session.command());

        // Interactive runs need the terminal to themselves
        let progress = show_progress(cli) && !self.interactive;
        let end = stream_session(session, progress).await?;

        if end.interrupted {
            eprintln!("{}", "Update interrupted".yellow());
        } else if end.outcome.success() {
            eprintln!("{}", "Update finished".green());
        } else {
            eprintln!(
                "{}",
                format!("Update script exited with status {}", end.outcome.exit_code()).red()
            );
        }
        Ok(end.exit_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_interactive_conflicts_with_password_stdin() {
        assert!(
            Cli::try_parse_from(["multi-updater", "run", "--interactive", "--password-stdin"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["multi-updater", "run", "--password-stdin"]).is_ok());
    }
}
