//! Helpers shared by the command modules: streaming a script session to the
//! terminal, reading the credential, and Ctrl-C handling.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use indicatif::ProgressBar;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;
use secrecy::zeroize::Zeroizing;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

use super::CliConfig;
use crate::checks::SourceReport;
use crate::constants::MAX_CREDENTIAL_LEN;
use crate::config::GlobalConfig;
use crate::runner::{Credential, ExitOutcome, OutputChunk, OutputStream, ProcessSession, SessionEvent};
use crate::upgrade::{CancelFlag, SelfUpdater};
use crate::utils::progress::percent_bar;

/// Exit status used when the user interrupts a command.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Whether bars and spinners should be drawn.
pub fn show_progress(config: &CliConfig) -> bool {
    !config.no_progress && io::stderr().is_terminal()
}

/// Upper bound for the startup release check.
const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Print a hint when `[upgrade] check_on_startup` is set and a newer
/// release exists. Failures are only logged.
pub async fn notify_if_outdated(config: &GlobalConfig) {
    if !config.upgrade.check_on_startup {
        return;
    }
    let check = async {
        let updater = SelfUpdater::from_config(config)?;
        updater.check(None).await
    };
    match tokio::time::timeout(STARTUP_CHECK_TIMEOUT, check).await {
        Ok(Ok(check)) if check.update_available => {
            eprintln!(
                "{}",
                format!(
                    "multi-updater {} is available (run `multi-updater self-update`)",
                    check.latest.version
                )
                .yellow()
            );
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(target: "cli", "Startup release check failed: {e:#}"),
        Err(_) => debug!(target: "cli", "Startup release check timed out"),
    }
}

/// How a streamed session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnd {
    pub outcome: ExitOutcome,
    /// The session was stopped because of Ctrl-C.
    pub interrupted: bool,
}

impl SessionEnd {
    pub const fn exit_code(&self) -> i32 {
        if self.interrupted {
            INTERRUPTED_EXIT_CODE
        } else {
            self.outcome.exit_code()
        }
    }
}

enum Step {
    Event(Option<SessionEvent>),
    Interrupt,
}

/// Copy the script's output to our stdout/stderr byte for byte until it
/// exits. Progress lines move the bar when one is shown. Ctrl-C stops the
/// script.
pub async fn stream_session(mut session: ProcessSession, progress: bool) -> Result<SessionEnd> {
    let bar = progress.then(|| {
        let bar = percent_bar();
        bar.set_prefix("Updating");
        bar
    });
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let step = tokio::select! {
            event = session.next_event() => Step::Event(event),
            _ = &mut interrupt => Step::Interrupt,
        };

        match step {
            Step::Event(Some(SessionEvent::Output(chunk))) => write_chunk(bar.as_ref(), &chunk)?,
            Step::Event(Some(SessionEvent::Progress(event))) => {
                if let Some(bar) = &bar {
                    bar.set_position(u64::from(event.percent));
                    if let Some((current, total)) = event.step {
                        bar.set_message(format!("step {current}/{total}"));
                    }
                }
            }
            Step::Event(Some(SessionEvent::Finished(outcome))) => {
                finish_bar(bar.as_ref(), outcome.success());
                return Ok(SessionEnd {
                    outcome,
                    interrupted: false,
                });
            }
            Step::Event(None) => {
                let outcome = session.wait().await;
                finish_bar(bar.as_ref(), outcome.success());
                return Ok(SessionEnd {
                    outcome,
                    interrupted: false,
                });
            }
            Step::Interrupt => {
                if let Some(bar) = &bar {
                    bar.abandon_with_message("interrupted");
                }
                eprintln!("\n{}", "Interrupted, stopping the update script...".yellow());
                let outcome = session.stop().await;
                return Ok(SessionEnd {
                    outcome,
                    interrupted: true,
                });
            }
        }
    }
}

fn write_chunk(bar: Option<&ProgressBar>, chunk: &OutputChunk) -> Result<()> {
    let write = || -> io::Result<()> {
        match chunk.stream {
            OutputStream::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(&chunk.bytes)?;
                out.flush()
            }
            OutputStream::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(&chunk.bytes)?;
                err.flush()
            }
        }
    };
    match bar {
        Some(bar) => bar.suspend(write),
        None => write(),
    }
    .context("Failed to write script output")
}

fn finish_bar(bar: Option<&ProgressBar>, success: bool) {
    if let Some(bar) = bar {
        if success {
            bar.set_position(100);
            bar.finish_with_message("done");
        } else {
            bar.abandon_with_message("failed");
        }
    }
}

/// Read the credential as a single line from stdin.
///
/// The trailing line break is dropped; anything else on the line, including
/// surrounding spaces, is part of the credential.
pub async fn read_credential() -> Result<Credential> {
    read_credential_from(&mut tokio::io::stdin()).await
}

/// Byte-wise into a fixed-capacity buffer that is zeroed on drop. Nothing
/// past the line break is consumed.
async fn read_credential_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Credential> {
    let mut line = Zeroizing::new(Vec::with_capacity(MAX_CREDENTIAL_LEN));
    loop {
        match reader.read_u8().await {
            Ok(b'\n') => break,
            Ok(_) if line.len() == MAX_CREDENTIAL_LEN => {
                bail!("The password on stdin is longer than {MAX_CREDENTIAL_LEN} bytes");
            }
            Ok(byte) => line.push(byte),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("Failed to read the password from stdin"),
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.is_empty() {
        bail!("--password-stdin was given but stdin held no password");
    }

    let secret = std::str::from_utf8(&line).context("The password on stdin is not valid UTF-8")?;
    debug!(target: "cli", "Read credential from stdin");
    Ok(Credential::new(secret))
}

/// Set `cancel` on the first Ctrl-C. Abort the handle once the guarded
/// operation is over.
pub fn cancel_on_ctrl_c(cancel: CancelFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Cancelling after the current step...".yellow());
            cancel.cancel();
        }
    })
}

/// One colored line for a source report.
pub fn format_report(report: &SourceReport) -> String {
    let label = format!("{:<16}", report.source.label());
    let summary = report.summary();
    let summary = if report.is_error() {
        summary.red()
    } else if report.has_update {
        summary.yellow()
    } else {
        summary.green()
    };
    let mut line = format!("{} {}", label.bold(), summary);
    if report.has_update && !report.package_names.is_empty() {
        let names = report.package_names.iter().take(8).cloned().collect::<Vec<_>>().join(", ");
        let more = report.package_names.len().saturating_sub(8);
        line.push_str(&format!("\n{:<16} {}", "", names.dimmed()));
        if more > 0 {
            line.push_str(&format!(" {}", format!("(+{more} more)").dimmed()));
        }
    }
    line
}
