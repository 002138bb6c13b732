use anyhow::Result;
use clap::Args;
use colored::Colorize;
use tracing::debug;

use super::CliConfig;
use super::common::{format_report, notify_if_outdated, show_progress, stream_session};
use crate::checks::{default_probes, spawn_checks};
use crate::runner::{ProcessSupervisor, RunMode, SupervisorConfig};

/// Dry run of the update script.
#[derive(Args, Debug)]
pub struct CheckCommand {
    /// Also query every package source directly, in parallel
    #[arg(long)]
    sources: bool,
}

impl CheckCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<i32> {
        let config = cli.load().await?;
        notify_if_outdated(&config).await;
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_global(&config)?);

        // Started first so the probes overlap with the dry run
        let reports = if self.sources {
            Some(spawn_checks(default_probes(&config)?))
        } else {
            None
        };

        let session = supervisor.start(RunMode::DryRun, None).await?;
        debug!(target: "cli", "Dry run started: {:?}", session.command());
        let end = stream_session(session, show_progress(cli)).await?;

        if let Some(mut reports) = reports
            && !end.interrupted
        {
            println!("\n{}", "Package sources".bold());
            while let Some(report) = reports.recv().await {
                println!("{}", format_report(&report));
            }
        }

        if !end.outcome.success() && !end.interrupted {
            eprintln!(
                "{}",
                format!("Dry run exited with status {}", end.outcome.exit_code()).red()
            );
        }
        Ok(end.exit_code())
    }
}
