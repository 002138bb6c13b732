//! In-process stand-ins for the release API and the downloader.

use anyhow::Result;
use std::path::Path;

use crate::upgrade::CancelFlag;
use crate::upgrade::source::{ArchiveFetcher, DownloadError, DownloadProgressFn};
use crate::upgrade::version::{ReleaseInfo, VersionSource, normalize_version};

/// Serves one fixed release; `release(v)` reuses its URLs for any `v`.
#[derive(Debug, Clone)]
pub struct FakeVersionSource {
    release: ReleaseInfo,
}

impl FakeVersionSource {
    pub const fn new(release: ReleaseInfo) -> Self {
        Self {
            release,
        }
    }

    /// A release whose archive is the local file `zip`.
    pub fn local(version: &str, zip: &Path) -> Self {
        Self::new(ReleaseInfo {
            version: normalize_version(version),
            archive_url: zip.display().to_string(),
            assets: Vec::new(),
            published_at: None,
        })
    }
}

impl VersionSource for FakeVersionSource {
    async fn latest_release(&self) -> Result<ReleaseInfo> {
        Ok(self.release.clone())
    }

    async fn release(&self, version: &str) -> Result<ReleaseInfo> {
        Ok(ReleaseInfo {
            version: normalize_version(version),
            ..self.release.clone()
        })
    }
}

/// Treats URLs as local paths (`file://` optional).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl ArchiveFetcher for LocalFetcher {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelFlag,
        progress: &DownloadProgressFn,
    ) -> Result<u64, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let source = url.strip_prefix("file://").unwrap_or(url);
        let bytes = tokio::fs::copy(source, dest).await?;
        progress(bytes, Some(bytes));
        Ok(bytes)
    }
}
