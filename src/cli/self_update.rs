//! `self-update`: check for and install new releases of the updater.

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use indicatif::ProgressBar;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::CliConfig;
use super::common::{INTERRUPTED_EXIT_CODE, cancel_on_ctrl_c, show_progress};
use crate::core::UpdaterError;
use crate::upgrade::{CancelFlag, SelfUpdateOutcome, SelfUpdater, UpdateEvent, UpdateEventFn};
use crate::utils::progress::{download_bar, spinner_with_message};

#[derive(Args, Debug)]
pub struct SelfUpdateCommand {
    /// Version to install (default: latest release)
    #[arg(value_name = "VERSION")]
    version: Option<String>,

    /// Only report whether an update is available
    #[arg(long, conflicts_with_all = ["force", "from_file"])]
    check: bool,

    /// Reinstall even when already on the target version
    #[arg(short, long)]
    force: bool,

    /// Download a release archive even if the installation is a git checkout
    #[arg(long)]
    archive: bool,

    /// Install from a release zip on disk instead of downloading (needs VERSION)
    #[arg(long, value_name = "ZIP", requires = "version", conflicts_with = "archive")]
    from_file: Option<PathBuf>,
}

impl SelfUpdateCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<i32> {
        let config = cli.load().await?;
        let updater = SelfUpdater::from_config(&config)?.force(self.force).force_archive(self.archive);

        if self.check {
            return check(&updater, self.version.as_deref()).await;
        }

        let cancel = CancelFlag::new();
        let ctrl_c = cancel_on_ctrl_c(cancel.clone());
        let display = Arc::new(EventDisplay::new(show_progress(cli)));
        let events: Arc<UpdateEventFn> = {
            let display = Arc::clone(&display);
            Arc::new(move |event| display.handle(event))
        };

        let result = match &self.from_file {
            Some(archive) => {
                let Some(version) = self.version.as_deref() else {
                    bail!("--from-file needs the VERSION the archive contains");
                };
                println!("{}", format!("Installing {} from {}", version, archive.display()).cyan());
                updater.install_archive(archive, version, &cancel, events).await
            }
            None => updater.update(self.version.as_deref(), &cancel, events).await,
        };
        ctrl_c.abort();
        display.clear();

        report(result?)
    }
}

async fn check<V, F>(updater: &SelfUpdater<V, F>, target: Option<&str>) -> Result<i32>
where
    V: crate::upgrade::VersionSource,
    F: crate::upgrade::ArchiveFetcher,
{
    println!("{}", "Checking for updates...".cyan());
    let check = updater.check(target).await?;
    let current = check.current.as_deref().unwrap_or("unknown");

    if check.update_available {
        println!(
            "{}",
            format!("Update available: {} -> {}", current, check.latest.version).green()
        );
        println!("Run `multi-updater self-update` to install it");
    } else {
        println!("{}", format!("You are on the latest version ({current})").green());
    }
    Ok(0)
}

fn report(outcome: SelfUpdateOutcome) -> Result<i32> {
    match outcome {
        SelfUpdateOutcome::UpToDate {
            version,
        } => {
            let version = version.as_deref().unwrap_or("unknown");
            println!("{}", format!("Already on the latest version ({version})").green());
            Ok(0)
        }
        SelfUpdateOutcome::Updated {
            from,
            to,
            backup_removed,
        } => {
            let from = from.as_deref().unwrap_or("unknown");
            println!("{}", format!("Updated {from} -> {to}").green().bold());
            if !backup_removed {
                println!("{}", "The pre-update backup was kept; see `multi-updater backups list`".yellow());
            }
            Ok(0)
        }
        SelfUpdateOutcome::Pulled {
            report,
            version,
        } => {
            if report.updated {
                println!(
                    "{}",
                    format!(
                        "Pulled {} -> {} ({version})",
                        short(report.old_revision.as_deref()),
                        short(report.new_revision.as_deref())
                    )
                    .green()
                    .bold()
                );
            } else {
                println!("{}", "Working copy already up to date".green());
            }
            Ok(0)
        }
        SelfUpdateOutcome::RolledBack {
            reason,
            recovery,
        } => Err(UpdaterError::RolledBack {
            reason: reason.to_string(),
            recovery: recovery.to_string(),
        }
        .into()),
        SelfUpdateOutcome::Cancelled => {
            println!("{}", "Self-update cancelled; the installation is unchanged".yellow());
            Ok(INTERRUPTED_EXIT_CODE)
        }
    }
}

fn short(revision: Option<&str>) -> &str {
    revision.map_or("unknown", |r| r.get(..8).unwrap_or(r))
}

/// Turns update events into a spinner and a download bar.
struct EventDisplay {
    enabled: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl EventDisplay {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            bar: Mutex::new(None),
        }
    }

    fn handle(&self, event: UpdateEvent) {
        let Ok(mut bar) = self.bar.lock() else {
            return;
        };
        match event {
            UpdateEvent::Resolving if self.enabled => {
                *bar = Some(spinner_with_message("Resolving release"));
            }
            UpdateEvent::Fetching {
                version,
                method,
            } => {
                if let Some(old) = bar.take() {
                    old.finish_and_clear();
                }
                let message = format!("Fetching {version} ({method})");
                if self.enabled {
                    *bar = Some(spinner_with_message(message));
                } else {
                    println!("{message}");
                }
            }
            UpdateEvent::Download {
                downloaded,
                total,
            } if self.enabled => {
                let needs_bar = bar.as_ref().is_none_or(|b| b.length() != total);
                if needs_bar {
                    if let Some(old) = bar.take() {
                        old.finish_and_clear();
                    }
                    let new = download_bar(total);
                    new.set_prefix("Downloading");
                    *bar = Some(new);
                }
                if let Some(bar) = bar.as_ref() {
                    bar.set_position(downloaded);
                }
            }
            UpdateEvent::Stage(stage) => {
                if let Some(old) = bar.take() {
                    old.finish_and_clear();
                }
                println!("  {} {}", "✓".green(), stage);
            }
            _ => {}
        }
    }

    fn clear(&self) {
        if let Ok(mut bar) = self.bar.lock()
            && let Some(bar) = bar.take()
        {
            bar.finish_and_clear();
        }
    }
}
