//! Where new versions come from, and how versions compare.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::future::Future;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::constants::{ENTRY_SCRIPT, HTTP_DOWNLOAD_TIMEOUT, HTTP_METADATA_TIMEOUT, VERSION_FILE};
use crate::upgrade::verification::CHECKSUM_ASSET_NAMES;
use crate::utils::fs::atomic_write;

const GITHUB_API: &str = "https://api.github.com";

static SCRIPT_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*readonly\s+SCRIPT_VERSION=["']?([^"'\s]+)["']?"#)
        .expect("script version pattern is valid")
});

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub size: u64,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

/// A published version of the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Bare version, without a leading `v`.
    pub version: String,
    /// Source archive of the tagged tree.
    pub archive_url: String,
    pub assets: Vec<ReleaseAsset>,
    pub published_at: Option<DateTime<Utc>>,
}

impl ReleaseInfo {
    /// A release known only by its tag.
    pub fn from_tag(repo: &str, tag: &str) -> Self {
        let version = normalize_version(tag);
        Self {
            archive_url: archive_url(repo, &version),
            version,
            assets: Vec::new(),
            published_at: None,
        }
    }

    /// A `.zip` asset published with the release, if any.
    pub fn archive_asset(&self) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name.ends_with(".zip"))
    }

    pub fn checksum_asset(&self) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| CHECKSUM_ASSET_NAMES.contains(&a.name.as_str()))
    }
}

/// Supplies release metadata.
pub trait VersionSource: Send + Sync {
    fn latest_release(&self) -> impl Future<Output = Result<ReleaseInfo>> + Send;

    fn release(&self, version: &str) -> impl Future<Output = Result<ReleaseInfo>> + Send;

    /// Expected SHA-256 of `asset`, when the release publishes one.
    fn expected_checksum(
        &self,
        _release: &ReleaseInfo,
        _asset: &ReleaseAsset,
    ) -> impl Future<Output = Result<Option<String>>> + Send {
        async { Ok(None) }
    }
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct GithubTag {
    name: String,
}

/// Release metadata from the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    repo: String,
    api_base: String,
    client: reqwest::Client,
}

impl GithubReleases {
    pub fn new(repo: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("multi-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(HTTP_METADATA_TIMEOUT)
            .timeout(HTTP_DOWNLOAD_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            repo: repo.into(),
            api_base: GITHUB_API.to_string(),
            client,
        })
    }

    /// Point at another API host (GitHub Enterprise, test servers).
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}/repos/{}/{path}", self.api_base, self.repo);
        debug!(target: "upgrade", "GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(HTTP_METADATA_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to query {url}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().with_context(|| format!("GitHub API error for {url}"))?;
        let body = response.json().await.with_context(|| format!("Invalid response from {url}"))?;
        Ok(Some(body))
    }

    fn to_info(&self, release: GithubRelease) -> ReleaseInfo {
        ReleaseInfo {
            assets: release.assets,
            published_at: release.published_at,
            ..ReleaseInfo::from_tag(&self.repo, &release.tag_name)
        }
    }
}

impl VersionSource for GithubReleases {
    async fn latest_release(&self) -> Result<ReleaseInfo> {
        if let Some(release) = self.get_json::<GithubRelease>("releases/latest").await? {
            return Ok(self.to_info(release));
        }

        // Repositories that only push tags have no release objects
        warn!(target: "upgrade", "No published release for {}, falling back to tags", self.repo);
        let tags: Vec<GithubTag> = self.get_json("tags").await?.unwrap_or_default();
        let newest = tags
            .into_iter()
            .map(|t| t.name)
            .max_by(|a, b| compare_versions(a, b))
            .with_context(|| format!("No releases or tags found for {}", self.repo))?;
        Ok(ReleaseInfo::from_tag(&self.repo, &newest))
    }

    async fn release(&self, version: &str) -> Result<ReleaseInfo> {
        let version = normalize_version(version);
        match self.get_json::<GithubRelease>(&format!("releases/tags/v{version}")).await? {
            Some(release) => Ok(self.to_info(release)),
            None => Ok(ReleaseInfo::from_tag(&self.repo, &version)),
        }
    }

    async fn expected_checksum(
        &self,
        release: &ReleaseInfo,
        asset: &ReleaseAsset,
    ) -> Result<Option<String>> {
        match release.checksum_asset() {
            Some(sums) => {
                crate::upgrade::verification::ChecksumVerifier::fetch_expected_checksum(
                    &self.client,
                    &sums.download_url,
                    &asset.name,
                )
                .await
            }
            None => Ok(None),
        }
    }
}

/// Source archive URL for a tagged version.
pub fn archive_url(repo: &str, version: &str) -> String {
    format!("https://github.com/{repo}/archive/refs/tags/v{}.zip", normalize_version(version))
}

pub fn normalize_version(version: &str) -> String {
    version.trim().trim_start_matches(['v', 'V']).to_string()
}

/// Order two version strings. Semantic versions compare by semver; anything
/// else by its dotted numeric components.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (normalize_version(a), normalize_version(b));
    match (semver::Version::parse(&a), semver::Version::parse(&b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => numeric_parts(&a).cmp(&numeric_parts(&b)),
    }
}

fn numeric_parts(version: &str) -> Vec<u64> {
    let mut parts: Vec<u64> = version
        .split(['.', '-', '+'])
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect();
    while parts.last() == Some(&0) {
        parts.pop();
    }
    parts
}

/// Whether `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

/// Installed version: the `VERSION` file at the install root, else the
/// `SCRIPT_VERSION` declared by the update script.
pub fn read_local_version(install_root: &Path, script_dir: &Path) -> Option<String> {
    if let Ok(content) = std::fs::read_to_string(install_root.join(VERSION_FILE)) {
        let version = normalize_version(&content);
        if !version.is_empty() {
            return Some(version);
        }
    }

    let script = std::fs::read_to_string(script_dir.join(ENTRY_SCRIPT)).ok()?;
    SCRIPT_VERSION_RE.captures(&script).map(|c| normalize_version(&c[1]))
}

/// Atomically replace the `VERSION` file.
pub fn write_version_file(install_root: &Path, version: &str) -> Result<()> {
    let version = normalize_version(version);
    atomic_write(&install_root.join(VERSION_FILE), format!("{version}\n").as_bytes())
        .context("Failed to write VERSION file")
}
