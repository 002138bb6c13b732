//! Producing a ready-to-install tree for a target version.
//!
//! The install method is picked once per fetch: a git working copy at the
//! install root is fast-forwarded in place, anything else downloads the
//! version's archive and extracts it into a staging directory next to the
//! live installation (same filesystem, so the later swap is a rename).
//!
//! Cancellation is polled before the download, between downloaded chunks,
//! before extraction and before the project folder is handed out. A
//! cancelled or failed fetch never touches the live installation, and the
//! staging directory is removed with its [`TempDir`].

use anyhow::{Context, Result};
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{GlobalConfig, NetworkConfig};
use crate::constants::{
    DEFAULT_DOWNLOAD_RETRIES, DEFAULT_RETRY_DELAY, ENTRY_SCRIPT, HTTP_DOWNLOAD_TIMEOUT,
    HTTP_METADATA_TIMEOUT, PROJECT_SEARCH_DEPTH,
};
use crate::core::UpdaterError;
use crate::git::{PullReport, WorkingCopy};
use crate::upgrade::CancelFlag;
use crate::upgrade::verification::ChecksumVerifier;

/// Callback for download progress: `(bytes so far, total if known)`.
pub type DownloadProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// How the installation gets updated. Chosen once per fetch.
#[derive(Debug, Clone)]
pub enum InstallMethod {
    Vcs(WorkingCopy),
    Archive,
}

impl InstallMethod {
    /// `Vcs` when the install root is a git working copy.
    pub fn detect(install_root: &Path) -> Self {
        WorkingCopy::open(install_root).map_or(Self::Archive, Self::Vcs)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Vcs(_) => "git",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A complete, not-yet-live copy of the tool.
///
/// Owns the temporary directory it lives in; dropping it removes everything
/// that was not moved out.
#[derive(Debug)]
pub struct StagingDirectory {
    temp: TempDir,
    project_dir: PathBuf,
    aux_dir: PathBuf,
    version: String,
}

impl StagingDirectory {
    /// Empty staging area inside `install_root`.
    pub fn temp_in(install_root: &Path, project: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!(".{project}-staging-"))
            .tempdir_in(install_root)
            .with_context(|| format!("Failed to create staging directory in {}", install_root.display()))
    }

    /// Locate the project folder inside an extracted tree.
    pub fn from_extracted(temp: TempDir, project: &str, version: impl Into<String>) -> Result<Self> {
        let project_dir = find_project_folder(temp.path(), project).ok_or_else(|| {
            UpdaterError::ProjectFolderNotFound {
                script: ENTRY_SCRIPT.to_string(),
            }
        })?;
        // Auxiliary files sit next to the project folder at the archive root
        let aux_dir = project_dir
            .parent()
            .filter(|p| p.starts_with(temp.path()))
            .map_or_else(|| project_dir.clone(), Path::to_path_buf);

        debug!(target: "upgrade", "Staged project folder: {}", project_dir.display());
        Ok(Self {
            temp,
            project_dir,
            aux_dir,
            version: version.into(),
        })
    }

    /// The tree that becomes the live directory.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Where top-level auxiliary files (license, readme) are taken from.
    pub fn aux_dir(&self) -> &Path {
        &self.aux_dir
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }
}

/// Result of [`UpdateSourceResolver::fetch`].
#[derive(Debug)]
pub enum FetchOutcome {
    Staged(StagingDirectory),
    Pulled(PullReport),
    Cancelled,
}

/// What to download for the archive method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub version: String,
    pub url: String,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
}

impl FetchRequest {
    pub fn new(version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            url: url.into(),
            expected_size: None,
            expected_sha256: None,
        }
    }
}

/// A failed download attempt.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error("{0}")]
    Transfer(String),
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        Self::Transfer(e.to_string())
    }
}

/// Transfers an archive to a local file.
pub trait ArchiveFetcher: Send + Sync {
    /// Download `url` into `dest`, polling `cancel` between chunks.
    fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelFlag,
        progress: &DownloadProgressFn,
    ) -> impl Future<Output = Result<u64, DownloadError>> + Send;
}

/// Streaming HTTP(S) downloads via `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("multi-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(HTTP_METADATA_TIMEOUT)
            .timeout(HTTP_DOWNLOAD_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
        })
    }
}

impl ArchiveFetcher for HttpFetcher {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelFlag,
        progress: &DownloadProgressFn,
    ) -> Result<u64, DownloadError> {
        let transfer = |e: reqwest::Error| DownloadError::Transfer(e.to_string());

        let response = self.client.get(url).send().await.map_err(transfer)?;
        let response = response.error_for_status().map_err(transfer)?;
        let total = response.content_length();

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let chunk = chunk.map_err(transfer)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(total) = total
            && downloaded != total
        {
            return Err(DownloadError::Transfer(format!(
                "connection closed after {downloaded} of {total} bytes"
            )));
        }
        Ok(downloaded)
    }
}

/// Cheap TCP reachability check run before downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProbe {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl NetworkProbe {
    pub fn from_config(config: &NetworkConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            host: config.check_host.clone(),
            port: config.check_port,
            timeout: Duration::from_secs(config.check_timeout_secs),
        })
    }

    pub async fn check(&self) -> Result<(), UpdaterError> {
        let addr = (self.host.as_str(), self.port);
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                debug!(target: "upgrade", "Reachability probe failed: {}", e);
                Err(self.unreachable())
            }
            Err(_) => Err(self.unreachable()),
        }
    }

    fn unreachable(&self) -> UpdaterError {
        UpdaterError::NetworkUnreachable {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Settings for [`UpdateSourceResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub install_root: PathBuf,
    pub project: String,
    pub retries: u32,
    pub retry_delay: Duration,
    pub network_probe: Option<NetworkProbe>,
    /// Download even when the install root is a working copy.
    pub force_archive: bool,
}

impl ResolverConfig {
    pub fn new(install_root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            install_root: install_root.into(),
            project: project.into(),
            retries: DEFAULT_DOWNLOAD_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            network_probe: None,
            force_archive: false,
        }
    }

    pub fn from_global(config: &GlobalConfig, install_root: PathBuf, project: String) -> Self {
        Self {
            retries: config.upgrade.download_retries,
            retry_delay: config.upgrade.retry_delay(),
            network_probe: NetworkProbe::from_config(&config.network),
            ..Self::new(install_root, project)
        }
    }
}

/// Fetches a target version by pull or by archive.
#[derive(Debug, Clone)]
pub struct UpdateSourceResolver<F = HttpFetcher> {
    config: ResolverConfig,
    fetcher: F,
}

impl<F: ArchiveFetcher> UpdateSourceResolver<F> {
    pub const fn new(config: ResolverConfig, fetcher: F) -> Self {
        Self {
            config,
            fetcher,
        }
    }

    pub const fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Download an archive even when the install root is a working copy.
    #[must_use]
    pub fn force_archive(mut self, force: bool) -> Self {
        self.config.force_archive = force;
        self
    }

    pub fn method(&self) -> InstallMethod {
        if self.config.force_archive {
            InstallMethod::Archive
        } else {
            InstallMethod::detect(&self.config.install_root)
        }
    }

    /// Produce the target version, reporting download progress.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancelFlag,
        progress: &DownloadProgressFn,
    ) -> Result<FetchOutcome> {
        let method = self.method();
        info!(target: "upgrade", "Fetching {} via {}", request.version, method);

        match method {
            InstallMethod::Vcs(copy) => self.pull_with_retry(&copy, cancel).await,
            InstallMethod::Archive => self.fetch_archive(request, cancel, progress).await,
        }
    }

    async fn fetch_archive(
        &self,
        request: &FetchRequest,
        cancel: &CancelFlag,
        progress: &DownloadProgressFn,
    ) -> Result<FetchOutcome> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        if let Some(probe) = &self.config.network_probe {
            probe.check().await?;
        }

        let temp = StagingDirectory::temp_in(&self.config.install_root, &self.config.project)?;
        let archive = temp.path().join("download.zip");

        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        match self.download_with_retry(&request.url, &archive, cancel, progress).await {
            Ok(bytes) => debug!(target: "upgrade", "Downloaded {} bytes", bytes),
            Err(DownloadOutcome::Cancelled) => {
                info!(target: "upgrade", "Download cancelled");
                return Ok(FetchOutcome::Cancelled);
            }
            Err(DownloadOutcome::Failed(e)) => return Err(e.into()),
        }

        if let Some(size) = request.expected_size {
            ChecksumVerifier::verify_size(&archive, size).await?;
        }
        if let Some(expected) = &request.expected_sha256 {
            ChecksumVerifier::verify_checksum(&archive, expected).await?;
        }

        self.stage_archive(temp, &archive, &request.version, cancel).await
    }

    /// Stage an archive that is already on disk.
    pub async fn stage_local_archive(
        &self,
        archive: &Path,
        version: &str,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome> {
        if !archive.is_file() {
            return Err(UpdaterError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("archive not found: {}", archive.display()),
            ))
            .into());
        }
        let temp = StagingDirectory::temp_in(&self.config.install_root, &self.config.project)?;
        self.stage_archive(temp, archive, version, cancel).await
    }

    async fn stage_archive(
        &self,
        temp: TempDir,
        archive: &Path,
        version: &str,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }

        let extract_dir = temp.path().join("extracted");
        let (src, dst) = (archive.to_path_buf(), extract_dir.clone());
        tokio::task::spawn_blocking(move || extract_zip(&src, &dst))
            .await
            .context("Extraction task panicked")??;

        let download = temp.path().join("download.zip");
        if download.exists()
            && let Err(e) = tokio::fs::remove_file(&download).await
        {
            debug!(target: "upgrade", "Could not remove downloaded archive: {}", e);
        }

        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        let staging = StagingDirectory::from_extracted(temp, &self.config.project, version)?;
        Ok(FetchOutcome::Staged(staging))
    }

    async fn download_with_retry(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelFlag,
        progress: &DownloadProgressFn,
    ) -> Result<u64, DownloadOutcome> {
        let attempts = self.config.retries.max(1);
        let strategy = FixedInterval::new(self.config.retry_delay).take(attempts as usize - 1);
        let mut attempt = 0u32;

        let result = RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                let n = attempt;
                async move {
                    debug!(target: "upgrade", "Download attempt {}/{}: {}", n, attempts, url);
                    self.fetcher.download(url, dest, cancel, progress).await.inspect_err(|e| {
                        if !matches!(e, DownloadError::Cancelled) {
                            warn!(target: "upgrade", "Download attempt {} failed: {}", n, e);
                        }
                    })
                }
            },
            |e: &DownloadError| !matches!(e, DownloadError::Cancelled) && !cancel.is_cancelled(),
        )
        .await;

        match result {
            Ok(bytes) => Ok(bytes),
            Err(DownloadError::Cancelled) => Err(DownloadOutcome::Cancelled),
            Err(_) if cancel.is_cancelled() => Err(DownloadOutcome::Cancelled),
            Err(DownloadError::Transfer(reason)) => Err(DownloadOutcome::Failed(UpdaterError::DownloadFailed {
                url: url.to_string(),
                attempts,
                reason,
            })),
        }
    }

    /// Fast-forward `copy`, retrying transient git failures with the same
    /// budget and delay as downloads. `HEAD` is recorded once, before the
    /// first attempt.
    async fn pull_with_retry(&self, copy: &WorkingCopy, cancel: &CancelFlag) -> Result<FetchOutcome> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        let old_revision = copy.head_revision().await.ok();

        let attempts = self.config.retries.max(1);
        let strategy = FixedInterval::new(self.config.retry_delay).take(attempts as usize - 1);
        let mut attempt = 0u32;

        let result = RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                let n = attempt;
                async move {
                    if cancel.is_cancelled() {
                        return Err(PullAttemptError::Cancelled);
                    }
                    debug!(target: "upgrade", "Pull attempt {}/{}", n, attempts);
                    copy.fast_forward().await.map_err(|e| {
                        warn!(target: "upgrade", "Pull attempt {} failed: {}", n, e);
                        PullAttemptError::Failed(e)
                    })
                }
            },
            |e: &PullAttemptError| e.is_retryable() && !cancel.is_cancelled(),
        )
        .await;

        match result {
            Ok(output) => Ok(FetchOutcome::Pulled(copy.report_since(old_revision, &output).await)),
            Err(PullAttemptError::Cancelled) => Ok(FetchOutcome::Cancelled),
            Err(_) if cancel.is_cancelled() => Ok(FetchOutcome::Cancelled),
            Err(PullAttemptError::Failed(e)) => Err(e),
        }
    }
}

enum PullAttemptError {
    Cancelled,
    Failed(anyhow::Error),
}

impl PullAttemptError {
    /// Git failures and timeouts are worth another attempt; a missing git
    /// binary or a local I/O error is not.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Failed(e) => matches!(
                e.downcast_ref::<UpdaterError>(),
                Some(UpdaterError::GitCommandError { .. } | UpdaterError::Timedout { .. })
            ),
        }
    }
}

enum DownloadOutcome {
    Cancelled,
    Failed(UpdaterError),
}

/// Unpack `archive` into `dest`, refusing entries that escape it.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read zip archive {}", archive.display()))?;
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("Failed to read zip entry")?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(target: "upgrade", "Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create directory {}", out.display()))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let mut target = std::fs::File::create(&out)
            .with_context(|| format!("Failed to create {}", out.display()))?;
        io::copy(&mut entry, &mut target)
            .with_context(|| format!("Failed to extract {}", out.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode & 0o777))
                    .with_context(|| format!("Failed to set permissions on {}", out.display()))?;
            }
        }
    }
    Ok(())
}

/// The directory holding the entry script: one named `project` if there is
/// one, otherwise the shallowest.
pub fn find_project_folder(root: &Path, project: &str) -> Option<PathBuf> {
    let mut candidates: Vec<(bool, usize, PathBuf)> = WalkDir::new(root)
        .max_depth(PROJECT_SEARCH_DEPTH + 1)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == ENTRY_SCRIPT)
        .filter_map(|e| {
            let dir = e.path().parent()?.to_path_buf();
            let named = dir.file_name().is_some_and(|n| n == project);
            Some((!named, e.depth(), dir))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next().map(|(_, _, dir)| dir)
}
