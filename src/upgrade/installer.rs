//! All-or-nothing installation of a staged tree.
//!
//! ```text
//! BackedUp -> PermissionsSet -> Swapped -> Verified -> Finalized
//!     \______________\______________\_________\______> RolledBack
//! ```
//!
//! The live directory is absent only between two renames. Every step
//! returns an explicit [`StepFailure`]; the single `match` in
//! [`AtomicInstaller::install`] turns any failure after the backup into a
//! rollback: restore the previous tree when there was one, otherwise remove
//! the incomplete new one.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::constants::{
    AUXILIARY_FILES, CRITICAL_FILES, EXECUTABLE_FILES, EXECUTABLE_MODE, PRESERVED_FILES,
    SCRIPT_DIRECTORIES,
};
use crate::core::UpdaterError;
use crate::upgrade::CancelFlag;
use crate::upgrade::backup::{BackupRetentionPolicy, SidePathKind, side_path};
use crate::upgrade::source::StagingDirectory;
use crate::upgrade::version::write_version_file;
use crate::utils::fs::{atomic_write, copy_tree, ensure_dir, remove_dir_all};

/// Last stage an install reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallStage {
    BackedUp,
    PermissionsSet,
    Swapped,
    Verified,
    Finalized,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BackedUp => "backed up",
            Self::PermissionsSet => "permissions set",
            Self::Swapped => "swapped",
            Self::Verified => "verified",
            Self::Finalized => "finalized",
        })
    }
}

/// How a failed install was undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The previous installation is live again.
    RestoredFromBackup,
    /// There was no previous installation; the partial new one is gone.
    RemovedIncomplete,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RestoredFromBackup => "original installation restored",
            Self::RemovedIncomplete => "incomplete installation removed, no changes made",
        })
    }
}

#[derive(Debug)]
pub enum InstallOutcome {
    Installed {
        version: String,
        backup_removed: bool,
    },
    RolledBack {
        reason: UpdaterError,
        recovery: Recovery,
    },
    Cancelled,
}

/// Why a step stopped the install.
#[derive(Debug)]
enum StepFailure {
    Cancelled,
    Failed(UpdaterError),
}

impl From<anyhow::Error> for StepFailure {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(
            e.downcast_ref::<UpdaterError>()
                .cloned()
                .unwrap_or_else(|| UpdaterError::other(format!("{e:#}"))),
        )
    }
}

/// Paths touched so far, for rollback.
#[derive(Debug, Default)]
struct Progress {
    stage: Option<InstallStage>,
    backup: Option<PathBuf>,
    old: Option<PathBuf>,
    swapped: bool,
}

/// Installs staged trees into `<install_root>/<project>`.
#[derive(Debug, Clone)]
pub struct AtomicInstaller {
    install_root: PathBuf,
    project: String,
    critical_files: Vec<String>,
    executable_files: Vec<String>,
    script_dirs: Vec<String>,
    aux_files: Vec<String>,
    preserved_files: Vec<String>,
    retention: BackupRetentionPolicy,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

impl AtomicInstaller {
    pub fn new(install_root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            install_root: install_root.into(),
            project: project.into(),
            critical_files: owned(CRITICAL_FILES),
            executable_files: owned(EXECUTABLE_FILES),
            script_dirs: owned(SCRIPT_DIRECTORIES),
            aux_files: owned(AUXILIARY_FILES),
            preserved_files: owned(PRESERVED_FILES),
            retention: BackupRetentionPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_critical_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_files = files.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_retention(mut self, retention: BackupRetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn live_dir(&self) -> PathBuf {
        self.install_root.join(&self.project)
    }

    pub const fn retention(&self) -> &BackupRetentionPolicy {
        &self.retention
    }

    /// Install `staging`, reporting each completed stage to `on_stage`.
    ///
    /// Filesystem work runs on the blocking pool.
    pub async fn install<S>(
        &self,
        staging: StagingDirectory,
        cancel: &CancelFlag,
        on_stage: S,
    ) -> Result<InstallOutcome>
    where
        S: FnMut(InstallStage) + Send + 'static,
    {
        let installer = self.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || installer.install_blocking(staging, &cancel, on_stage))
            .await
            .context("Install task panicked")?
    }

    /// Synchronous body of [`install`](Self::install).
    pub fn install_blocking<S>(
        &self,
        staging: StagingDirectory,
        cancel: &CancelFlag,
        mut on_stage: S,
    ) -> Result<InstallOutcome>
    where
        S: FnMut(InstallStage),
    {
        if cancel.is_cancelled() {
            return Ok(InstallOutcome::Cancelled);
        }

        let mut progress = Progress::default();
        let result = self.run_steps(&staging, cancel, &mut progress, &mut on_stage);
        // Whatever was not moved into place goes away with the temp dir
        drop(staging);

        match result {
            Ok(version) => Ok(self.finalize(version, &progress, &mut on_stage)),
            Err(failure) => {
                let recovery = self.rollback(&progress)?;
                match failure {
                    StepFailure::Cancelled => {
                        info!(target: "upgrade", "Install cancelled: {}", recovery);
                        Ok(InstallOutcome::Cancelled)
                    }
                    StepFailure::Failed(reason) => {
                        warn!(target: "upgrade", "Install failed ({}): {}", reason, recovery);
                        Ok(InstallOutcome::RolledBack {
                            reason,
                            recovery,
                        })
                    }
                }
            }
        }
    }

    fn run_steps(
        &self,
        staging: &StagingDirectory,
        cancel: &CancelFlag,
        progress: &mut Progress,
        on_stage: &mut dyn FnMut(InstallStage),
    ) -> Result<String, StepFailure> {
        let live = self.live_dir();
        let mut reach = |progress: &mut Progress, stage: InstallStage| {
            debug!(target: "upgrade", "Install stage: {}", stage);
            progress.stage = Some(stage);
            on_stage(stage);
            if cancel.is_cancelled() {
                Err(StepFailure::Cancelled)
            } else {
                Ok(())
            }
        };

        self.backup(&live, progress)?;
        reach(progress, InstallStage::BackedUp)?;

        self.set_permissions(staging.project_dir())?;
        self.carry_over_user_files(&live, staging.project_dir())?;
        reach(progress, InstallStage::PermissionsSet)?;

        self.swap(staging.project_dir(), &live, progress)?;
        reach(progress, InstallStage::Swapped)?;

        self.verify(&live)?;
        reach(progress, InstallStage::Verified)?;

        self.copy_aux_files(staging.aux_dir());
        Ok(staging.version().to_string())
    }

    fn backup(&self, live: &Path, progress: &mut Progress) -> Result<(), StepFailure> {
        if !live.exists() {
            debug!(target: "upgrade", "No live installation at {}, fresh install", live.display());
            return Ok(());
        }
        let path = side_path(&self.install_root, &self.project, SidePathKind::Backup, Utc::now());
        info!(target: "upgrade", "Backing up {} to {}", live.display(), path.display());

        if let Err(e) = copy_tree(live, &path) {
            if let Err(cleanup) = remove_dir_all(&path) {
                warn!(target: "upgrade", "Failed to remove partial backup: {:#}", cleanup);
            }
            return Err(e.context("Failed to back up the live installation").into());
        }
        progress.backup = Some(path);
        Ok(())
    }

    /// Archives do not carry Unix mode bits reliably.
    fn set_permissions(&self, tree: &Path) -> Result<(), StepFailure> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut targets: Vec<PathBuf> =
                self.executable_files.iter().map(|f| tree.join(f)).filter(|p| p.is_file()).collect();
            for dir in &self.script_dirs {
                for entry in walkdir::WalkDir::new(tree.join(dir)).follow_links(false) {
                    let Ok(entry) = entry else {
                        continue;
                    };
                    let is_script = entry.path().extension().is_some_and(|e| e == "sh" || e == "py");
                    if entry.file_type().is_file() && is_script {
                        targets.push(entry.into_path());
                    }
                }
            }

            for path in targets {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(EXECUTABLE_MODE))
                    .with_context(|| format!("Failed to make {} executable", path.display()))?;
            }
        }
        #[cfg(not(unix))]
        let _ = tree;
        Ok(())
    }

    /// Copy user files from the live tree into the staged one. Only the
    /// staged tree is written, so nothing here needs undoing.
    fn carry_over_user_files(&self, live: &Path, staged: &Path) -> Result<(), StepFailure> {
        for name in &self.preserved_files {
            let from = live.join(name);
            if !from.is_file() {
                continue;
            }
            let to = staged.join(name);
            if let Some(parent) = to.parent() {
                ensure_dir(parent)?;
            }
            std::fs::copy(&from, &to)
                .with_context(|| format!("Failed to carry over {}", from.display()))?;
            debug!(target: "upgrade", "Kept user file {}", name);
        }
        Ok(())
    }

    fn swap(&self, staged: &Path, live: &Path, progress: &mut Progress) -> Result<(), StepFailure> {
        if live.exists() {
            let old = side_path(&self.install_root, &self.project, SidePathKind::Old, Utc::now());
            std::fs::rename(live, &old).with_context(|| {
                format!("Failed to move {} aside to {}", live.display(), old.display())
            })?;
            progress.old = Some(old);
        }

        std::fs::rename(staged, live)
            .with_context(|| format!("Failed to move new installation into {}", live.display()))?;
        progress.swapped = true;
        info!(target: "upgrade", "New installation is live at {}", live.display());
        Ok(())
    }

    fn verify(&self, live: &Path) -> Result<(), StepFailure> {
        let missing: Vec<String> =
            self.critical_files.iter().filter(|f| !live.join(f).is_file()).cloned().collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StepFailure::Failed(UpdaterError::VerificationFailed {
                missing,
            }))
        }
    }

    /// Auxiliary files are best effort; user configuration is never touched.
    fn copy_aux_files(&self, source: &Path) {
        for name in &self.aux_files {
            let from = source.join(name);
            if !from.is_file() {
                continue;
            }
            let result = std::fs::read(&from)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| atomic_write(&self.install_root.join(name), &bytes));
            if let Err(e) = result {
                warn!(target: "upgrade", "Failed to copy {}: {:#}", name, e);
            }
        }
    }

    /// Drop the side paths, record the version and prune old backups.
    fn finalize(
        &self,
        version: String,
        progress: &Progress,
        on_stage: &mut dyn FnMut(InstallStage),
    ) -> InstallOutcome {
        if let Some(old) = &progress.old
            && let Err(e) = remove_dir_all(old)
        {
            warn!(target: "upgrade", "Failed to remove previous installation {}: {:#}", old.display(), e);
        }

        if let Err(e) = write_version_file(&self.install_root, &version) {
            warn!(target: "upgrade", "{:#}", e);
        }

        let backup_removed = match &progress.backup {
            Some(backup) => match remove_dir_all(backup) {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "upgrade", "Failed to remove backup {}: {:#}", backup.display(), e);
                    false
                }
            },
            None => false,
        };

        if let Err(e) = self.retention.enforce(&self.install_root, &self.project) {
            warn!(target: "upgrade", "Backup retention failed: {:#}", e);
        }

        on_stage(InstallStage::Finalized);
        info!(target: "upgrade", "Installed version {}", version);
        InstallOutcome::Installed {
            version,
            backup_removed,
        }
    }

    /// Undo everything after the backup.
    ///
    /// With a previous installation, its moved-aside directory is renamed
    /// back; the backup copy is the fallback when that is not possible.
    fn rollback(&self, progress: &Progress) -> Result<Recovery> {
        let live = self.live_dir();

        let Some(backup) = &progress.backup else {
            if progress.swapped {
                remove_dir_all(&live).context("Failed to remove incomplete installation")?;
            }
            return Ok(Recovery::RemovedIncomplete);
        };

        warn!(target: "upgrade", "Rolling back to the previous installation");
        if progress.swapped {
            remove_dir_all(&live).context("Failed to remove broken installation")?;
        }

        let restored_by_rename = match &progress.old {
            Some(old) if !live.exists() => match std::fs::rename(old, &live) {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "upgrade", "Could not move previous installation back: {}", e);
                    false
                }
            },
            _ => live.exists(),
        };

        if !restored_by_rename {
            if live.exists() {
                remove_dir_all(&live).context("Failed to clear live path before restore")?;
            }
            copy_tree(backup, &live).with_context(|| {
                error!(target: "upgrade", "Restore failed, backup kept at {}", backup.display());
                format!("Failed to restore from backup {}", backup.display())
            })?;
            if let Some(old) = &progress.old
                && let Err(e) = remove_dir_all(old)
            {
                warn!(target: "upgrade", "Failed to remove {}: {:#}", old.display(), e);
            }
        }

        if let Err(e) = remove_dir_all(backup) {
            warn!(target: "upgrade", "Failed to remove backup after restore: {:#}", e);
        }
        Ok(Recovery::RestoredFromBackup)
    }
}
