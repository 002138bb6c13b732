use anyhow::Result;
use chrono::{Local, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;

use super::CliConfig;
use crate::upgrade::self_updater::project_name;
use crate::upgrade::{BackupRetentionPolicy, list_backups};

/// Inspect or prune the backups left next to the installation.
#[derive(Args, Debug)]
pub struct BackupsCommand {
    #[command(subcommand)]
    command: Option<BackupsSubcommand>,
}

#[derive(Subcommand, Debug)]
enum BackupsSubcommand {
    /// List backups, newest first (default)
    List,

    /// Delete backups outside the retention policy
    Prune {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Keep this many backups instead of the configured number
        #[arg(long, value_name = "N")]
        keep: Option<usize>,
    },
}

impl BackupsCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<i32> {
        let config = cli.load().await?;
        let root = config.install_root()?;
        let project = project_name(&config.resolve_script_dir()?);

        match self.command.unwrap_or(BackupsSubcommand::List) {
            BackupsSubcommand::List => {
                let backups = list_backups(&root, &project)?;
                if backups.is_empty() {
                    println!("No backups of {project} in {}", root.display());
                    return Ok(0);
                }
                println!("{}", format!("Backups of {project}").bold());
                for backup in backups {
                    let name = backup.path.file_name().map(|n| n.to_string_lossy().into_owned());
                    println!(
                        "  {}  {}",
                        backup.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                        name.unwrap_or_default().cyan()
                    );
                }
            }
            BackupsSubcommand::Prune {
                dry_run,
                keep,
            } => {
                let mut policy = BackupRetentionPolicy::from(&config.upgrade);
                if let Some(keep) = keep {
                    policy.keep = keep;
                }

                if dry_run {
                    let backups = list_backups(&root, &project)?;
                    let doomed = policy.plan(&backups, Utc::now());
                    if doomed.is_empty() {
                        println!("Nothing to prune");
                    }
                    for backup in doomed {
                        println!("  would delete {}", backup.path.display());
                    }
                } else {
                    let removed = policy.enforce(&root, &project)?;
                    for path in &removed {
                        println!("  {} {}", "deleted".red(), path.display());
                    }
                    println!(
                        "{}",
                        format!("Pruned {} backup(s)", removed.len()).green()
                    );
                }
            }
        }
        Ok(0)
    }
}
