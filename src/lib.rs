//! multi-updater - update orchestrator for CachyOS
//!
//! A native driver for the `update-all.sh` update script and its installation:
//! it starts the script in dry-run, interactive or real mode, streams its
//! output byte for byte with progress parsing, hands over the `sudo`
//! credential without it ever touching argv, environment or disk, and keeps
//! the script's own installation up to date with an atomic, rollback-safe
//! self-update.
//!
//! # Architecture Overview
//!
//! ```text
//!  cli ──▶ runner::ProcessSupervisor ──▶ bash update-all.sh [--dry-run|--interactive]
//!   │            │                               │
//!   │            └── ProcessSession ◀── stdout/stderr chunks, progress, exit
//!   │
//!   ├──▶ checks::spawn_checks ──▶ one task per package source
//!   │
//!   └──▶ upgrade::SelfUpdater
//!             lock::UpdateLock ─▶ UpdateSourceResolver (git pull | zip) ─▶ AtomicInstaller
//! ```
//!
//! # Core Modules
//!
//! ## Running the update script
//! - [`runner`] - process supervision, output streaming, progress parsing,
//!   credential delivery
//! - [`checks`] - parallel "is there an update?" probes per package source
//!
//! ## Updating the installation
//! - [`upgrade`] - release resolution, download, staging, atomic install and rollback
//! - [`lock`] - cross-process update lock with stale-holder recovery
//! - [`git`] - the `git` command wrapper used for working-copy installs
//!
//! ## Supporting Modules
//! - [`cli`] - command-line interface
//! - [`config`] - user configuration (`~/.config/multi-updater/config.toml`)
//! - [`constants`] - fixed names, file sets and timeouts
//! - [`core`] - error taxonomy and user-facing error rendering
//! - [`logging`] - the `tracing` subscriber setup
//! - [`utils`] - filesystem helpers and progress styles
//!
//! # Installation Layout
//!
//! ```text
//! <install root>/
//! ├── VERSION                         installed version
//! ├── .update.lock                    present while an update runs
//! ├── cachyos-multi-updater/          live installation (update-all.sh, lib/, gui/)
//! ├── cachyos-multi-updater.backup.<timestamp>/
//! └── README.md, LICENSE, ...         auxiliary files copied from releases
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use multi_updater::config::GlobalConfig;
//! use multi_updater::runner::{ProcessSupervisor, RunMode, SessionEvent, SupervisorConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GlobalConfig::load().await?;
//! let supervisor = ProcessSupervisor::new(SupervisorConfig::from_global(&config)?);
//! let mut session = supervisor.start(RunMode::DryRun, None).await?;
//! while let Some(event) = session.next_event().await {
//!     match event {
//!         SessionEvent::Output(chunk) => print!("{}", chunk.text()),
//!         SessionEvent::Progress(p) => eprintln!("{}%", p.percent),
//!         SessionEvent::Finished(outcome) => eprintln!("exit: {}", outcome.exit_code()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod checks;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod git;
pub mod lock;
pub mod logging;
pub mod runner;
pub mod upgrade;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
