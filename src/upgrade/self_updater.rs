//! The self-update pipeline: lock, version check, fetch, install, release.
//!
//! [`SelfUpdater`] ties the pieces together. It holds the update lock for
//! the whole run, asks the [`VersionSource`] what is published, and has the
//! [`UpdateSourceResolver`] produce the target (a pull or a staged archive).
//! A staged archive goes to the [`AtomicInstaller`]. Progress is reported
//! through [`UpdateEvent`]s. Cancellation is polled between steps.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::constants::PROJECT_DIR_NAME;
use crate::core::UpdaterError;
use crate::git::PullReport;
use crate::lock::{LockAttempt, UpdateLock, UpdateLockGuard};
use crate::upgrade::CancelFlag;
use crate::upgrade::backup::BackupRetentionPolicy;
use crate::upgrade::installer::{AtomicInstaller, InstallOutcome, InstallStage, Recovery};
use crate::upgrade::source::{
    ArchiveFetcher, FetchOutcome, FetchRequest, HttpFetcher, ResolverConfig, StagingDirectory,
    UpdateSourceResolver,
};
use crate::upgrade::version::{
    GithubReleases, ReleaseInfo, VersionSource, is_newer, read_local_version, write_version_file,
};

/// Progress notifications from a running update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Resolving,
    Fetching {
        version: String,
        method: &'static str,
    },
    Download {
        downloaded: u64,
        total: Option<u64>,
    },
    Stage(InstallStage),
}

pub type UpdateEventFn = dyn Fn(UpdateEvent) + Send + Sync;

/// Installed vs. published version.
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    pub current: Option<String>,
    pub latest: ReleaseInfo,
    pub update_available: bool,
}

#[derive(Debug)]
pub enum SelfUpdateOutcome {
    UpToDate {
        version: Option<String>,
    },
    Updated {
        from: Option<String>,
        to: String,
        backup_removed: bool,
    },
    Pulled {
        report: PullReport,
        version: String,
    },
    RolledBack {
        reason: UpdaterError,
        recovery: Recovery,
    },
    Cancelled,
}

/// Lock, fetch, install, unlock.
pub struct SelfUpdater<V = GithubReleases, F = HttpFetcher> {
    source: V,
    resolver: UpdateSourceResolver<F>,
    installer: AtomicInstaller,
    lock: UpdateLock,
    script_dir: PathBuf,
    force: bool,
}

impl SelfUpdater {
    /// Updater for the installation described by `config`.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let script_dir = config.resolve_script_dir()?;
        let install_root = config.install_root()?;
        let project = project_name(&script_dir);

        let resolver = UpdateSourceResolver::new(
            ResolverConfig::from_global(config, install_root.clone(), project.clone()),
            HttpFetcher::new()?,
        );
        let installer = AtomicInstaller::new(install_root, project)
            .with_retention(BackupRetentionPolicy::from(&config.upgrade));

        Ok(Self::new(
            GithubReleases::new(&config.upgrade.repo)?,
            resolver,
            installer,
            UpdateLock::new(config.lock_dir()?),
            script_dir,
        ))
    }
}

/// The live directory's name, which backups and side paths are named after.
pub fn project_name(script_dir: &Path) -> String {
    script_dir
        .file_name()
        .and_then(|n| n.to_str())
        .map_or_else(|| PROJECT_DIR_NAME.to_string(), ToString::to_string)
}

impl<V: VersionSource, F: ArchiveFetcher> SelfUpdater<V, F> {
    pub const fn new(
        source: V,
        resolver: UpdateSourceResolver<F>,
        installer: AtomicInstaller,
        lock: UpdateLock,
        script_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            resolver,
            installer,
            lock,
            script_dir,
            force: false,
        }
    }

    /// Reinstall even when the target is not newer.
    #[must_use]
    pub const fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Skip `git pull` and install from a release archive.
    #[must_use]
    pub fn force_archive(mut self, force: bool) -> Self {
        self.resolver = self.resolver.force_archive(force);
        self
    }

    pub const fn installer(&self) -> &AtomicInstaller {
        &self.installer
    }

    pub const fn resolver(&self) -> &UpdateSourceResolver<F> {
        &self.resolver
    }

    pub fn current_version(&self) -> Option<String> {
        read_local_version(self.installer.install_root(), &self.script_dir)
    }

    async fn resolve(&self, target: Option<&str>) -> Result<ReleaseInfo> {
        match target {
            Some(version) => self.source.release(version).await,
            None => self.source.latest_release().await,
        }
        .context("Failed to resolve the target release")
    }

    pub async fn check(&self, target: Option<&str>) -> Result<UpdateCheck> {
        let current = self.current_version();
        let latest = self.resolve(target).await?;
        let update_available = current.as_deref().is_none_or(|c| is_newer(&latest.version, c));
        debug!(target: "upgrade", "Installed {:?}, published {}", current, latest.version);
        Ok(UpdateCheck {
            current,
            latest,
            update_available,
        })
    }

    fn acquire(&self) -> Result<UpdateLockGuard> {
        match self.lock.try_acquire()? {
            LockAttempt::Acquired(guard) => Ok(guard),
            LockAttempt::Busy {
                holder,
            } => Err(UpdaterError::LockBusy {
                holder,
            }
            .into()),
        }
    }

    /// Update to `target`, or to the latest release.
    pub async fn update(
        &self,
        target: Option<&str>,
        cancel: &CancelFlag,
        events: Arc<UpdateEventFn>,
    ) -> Result<SelfUpdateOutcome> {
        let guard = self.acquire()?;

        events(UpdateEvent::Resolving);
        let check = self.check(target).await?;
        if !self.force && !check.update_available {
            info!(target: "upgrade", "Already on {:?}", check.current);
            guard.release()?;
            return Ok(SelfUpdateOutcome::UpToDate {
                version: check.current,
            });
        }
        if cancel.is_cancelled() {
            guard.release()?;
            return Ok(SelfUpdateOutcome::Cancelled);
        }

        let release = check.latest;
        let request = self.fetch_request(&release).await;
        events(UpdateEvent::Fetching {
            version: release.version.clone(),
            method: self.resolver.method().name(),
        });

        let progress = {
            let events = Arc::clone(&events);
            move |downloaded: u64, total: Option<u64>| {
                events(UpdateEvent::Download {
                    downloaded,
                    total,
                });
            }
        };

        let outcome = match self.resolver.fetch(&request, cancel, &progress).await? {
            FetchOutcome::Cancelled => SelfUpdateOutcome::Cancelled,
            FetchOutcome::Pulled(report) => {
                if report.updated
                    && let Err(e) =
                        write_version_file(self.installer.install_root(), &release.version)
                {
                    warn!(target: "upgrade", "{:#}", e);
                }
                SelfUpdateOutcome::Pulled {
                    report,
                    version: release.version,
                }
            }
            FetchOutcome::Staged(staging) => {
                self.install_staged(staging, check.current, cancel, &events).await?
            }
        };

        guard.release()?;
        Ok(outcome)
    }

    /// Install a zip already on disk as `version`.
    pub async fn install_archive(
        &self,
        archive: &Path,
        version: &str,
        cancel: &CancelFlag,
        events: Arc<UpdateEventFn>,
    ) -> Result<SelfUpdateOutcome> {
        let guard = self.acquire()?;
        let current = self.current_version();

        let outcome = match self.resolver.stage_local_archive(archive, version, cancel).await? {
            FetchOutcome::Staged(staging) => {
                self.install_staged(staging, current, cancel, &events).await?
            }
            FetchOutcome::Pulled(_) | FetchOutcome::Cancelled => SelfUpdateOutcome::Cancelled,
        };

        guard.release()?;
        Ok(outcome)
    }

    async fn install_staged(
        &self,
        staging: StagingDirectory,
        from: Option<String>,
        cancel: &CancelFlag,
        events: &Arc<UpdateEventFn>,
    ) -> Result<SelfUpdateOutcome> {
        let events = Arc::clone(events);
        let outcome = self
            .installer
            .install(staging, cancel, move |stage| events(UpdateEvent::Stage(stage)))
            .await?;

        Ok(match outcome {
            InstallOutcome::Installed {
                version,
                backup_removed,
            } => SelfUpdateOutcome::Updated {
                from,
                to: version,
                backup_removed,
            },
            InstallOutcome::RolledBack {
                reason,
                recovery,
            } => SelfUpdateOutcome::RolledBack {
                reason,
                recovery,
            },
            InstallOutcome::Cancelled => SelfUpdateOutcome::Cancelled,
        })
    }

    /// Prefer a published `.zip` asset (with its size and checksum) over the
    /// tag's source archive.
    async fn fetch_request(&self, release: &ReleaseInfo) -> FetchRequest {
        let Some(asset) = release.archive_asset() else {
            return FetchRequest::new(&release.version, &release.archive_url);
        };

        let expected_sha256 = match self.source.expected_checksum(release, asset).await {
            Ok(checksum) => checksum,
            Err(e) => {
                warn!(target: "upgrade", "Could not fetch checksums: {:#}", e);
                None
            }
        };
        FetchRequest {
            expected_size: Some(asset.size),
            expected_sha256,
            ..FetchRequest::new(&release.version, &asset.download_url)
        }
    }
}
