//! Supervision of the update script.
//!
//! The script (`update-all.sh`) does the actual package work. This module
//! launches it, streams its output byte-for-byte, turns progress lines into
//! [`ProgressEvent`]s, and hands it the `sudo` credential through stdin.
//!
//! # Components
//!
//! - [`supervisor`]: pre-flight probes, argv construction, spawn and start diagnostics
//! - [`session`]: the running child, its event stream and lifecycle state
//! - [`credential`]: single-write credential delivery
//! - [`shim`]: the wrapper that turns a stdin line into a `sudo` session
//! - [`progress`]: the progress line parser
//!
//! # Example
//!
//! ```rust,no_run
//! use multi_updater::runner::{ProcessSupervisor, RunMode, SessionEvent, SupervisorConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let supervisor = ProcessSupervisor::new(SupervisorConfig::for_script("/opt/updater/update-all.sh"));
//! let mut session = supervisor.start(RunMode::DryRun, None).await?;
//! while let Some(event) = session.next_event().await {
//!     match event {
//!         SessionEvent::Output(chunk) => print!("{}", chunk.text()),
//!         SessionEvent::Progress(p) => eprintln!("{}%", p.percent),
//!         SessionEvent::Finished(outcome) => eprintln!("done: {outcome:?}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod credential;
pub mod progress;
pub mod session;
pub mod shim;
pub mod supervisor;

pub use credential::Credential;
pub use progress::ProgressEvent;
pub use session::{
    ExitOutcome, OutputChunk, OutputStream, ProcessSession, SessionEvent, SessionState,
};
pub use supervisor::{ProcessSupervisor, RunMode, SupervisorConfig};
