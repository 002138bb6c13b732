use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::CliConfig;
use super::common::{format_report, show_progress};
use crate::checks::{default_probes, spawn_checks};
use crate::utils::progress::spinner_with_message;

/// Query every enabled package source in parallel.
#[derive(Args, Debug)]
pub struct SourcesCommand {
    /// One JSON object per source, printed as each arrives
    #[arg(long)]
    json: bool,
}

impl SourcesCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<i32> {
        let config = cli.load().await?;
        let probes = default_probes(&config)?;
        let total = probes.len();
        if total == 0 {
            if !self.json {
                println!("{}", "All package sources are disabled in the configuration".yellow());
            }
            return Ok(0);
        }

        let mut reports = spawn_checks(probes);
        let spinner = (show_progress(cli) && !self.json)
            .then(|| spinner_with_message(format!("Checking {total} sources")));

        let mut received = 0;
        let mut pending_updates = 0;
        while let Some(report) = reports.recv().await {
            received += 1;
            if report.has_update {
                pending_updates += 1;
            }

            let line = if self.json {
                serde_json::to_string(&report).context("Failed to serialize report")?
            } else {
                format_report(&report)
            };
            match &spinner {
                Some(spinner) => {
                    spinner.suspend(|| println!("{line}"));
                    spinner.set_message(format!("Checking {} sources", total - received));
                }
                None => println!("{line}"),
            }
        }

        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        if !self.json {
            let summary = match pending_updates {
                0 => "Everything is up to date".green(),
                1 => "1 source has updates".yellow(),
                n => format!("{n} sources have updates").yellow(),
            };
            println!("\n{summary}");
        }
        Ok(0)
    }
}
