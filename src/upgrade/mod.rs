//! Self-update of the installed tool.
//!
//! The installation is a directory tree (`<root>/<project>/update-all.sh`,
//! `lib/`, `gui/`, ...) next to a `VERSION` file. Updating it is a linear
//! sequence, serialized across processes by [`UpdateLock`](crate::lock::UpdateLock):
//!
//! ```text
//! lock ─▶ resolve release ─▶ fetch (git pull | download + extract) ─▶ install ─▶ release lock
//!                                                                      │
//!                                   backup ─▶ chmod ─▶ swap ─▶ verify ─▶ finalize
//!                                        └──────────── rollback ◀─────────┘
//! ```
//!
//! # Modules
//!
//! - [`version`]: release metadata ([`VersionSource`], [`GithubReleases`]) and version ordering
//! - [`source`]: [`UpdateSourceResolver`], the pull and archive strategies
//! - [`installer`]: [`AtomicInstaller`], swap and rollback
//! - [`backup`]: backup naming and [`BackupRetentionPolicy`]
//! - [`verification`]: checksum and size checks for downloads
//! - [`self_updater`]: [`SelfUpdater`], the orchestration above
//!
//! # Example
//!
//! ```rust,no_run
//! use multi_updater::config::GlobalConfig;
//! use multi_updater::upgrade::{CancelFlag, SelfUpdateOutcome, SelfUpdater};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GlobalConfig::load().await?;
//! let updater = SelfUpdater::from_config(&config)?;
//! let outcome = updater.update(None, &CancelFlag::new(), Arc::new(|_| {})).await?;
//! if let SelfUpdateOutcome::Updated { to, .. } = outcome {
//!     println!("now at {to}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod installer;
pub mod self_updater;
pub mod source;
pub mod verification;
pub mod version;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use backup::{Backup, BackupRetentionPolicy, list_backups};
pub use installer::{AtomicInstaller, InstallOutcome, InstallStage, Recovery};
pub use self_updater::{SelfUpdateOutcome, SelfUpdater, UpdateCheck, UpdateEvent, UpdateEventFn};
pub use source::{
    ArchiveFetcher, FetchOutcome, FetchRequest, HttpFetcher, InstallMethod, StagingDirectory,
    UpdateSourceResolver,
};
pub use verification::ChecksumVerifier;
pub use version::{GithubReleases, ReleaseAsset, ReleaseInfo, VersionSource, is_newer};

/// Shared cancellation request, polled between update steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }
}
