//! Integrity checks for downloaded archives.
//!
//! Checksums use the `sha256:<hex>` form. Bare hex digests (as found in
//! `SHA256SUMS` files) are accepted on input and normalised.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::core::UpdaterError;

/// Checksum names looked for among release assets.
pub const CHECKSUM_ASSET_NAMES: &[&str] = &["SHA256SUMS", "SHA256SUMS.txt", "checksums.txt"];

pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// SHA-256 of a file, streamed.
    pub async fn compute_sha256(file_path: &Path) -> Result<String> {
        debug!(target: "upgrade", "Computing SHA256 checksum for: {}", file_path.display());

        let mut file = tokio::fs::File::open(file_path)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .with_context(|| format!("Failed to read file: {}", file_path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    pub fn normalize(checksum: &str) -> String {
        let lower = checksum.trim().to_lowercase();
        if lower.starts_with("sha256:") {
            lower
        } else {
            format!("sha256:{lower}")
        }
    }

    pub async fn verify_checksum(file_path: &Path, expected_checksum: &str) -> Result<()> {
        info!(target: "upgrade", "Verifying checksum for: {}", file_path.display());

        let expected = Self::normalize(expected_checksum);
        let actual = Self::compute_sha256(file_path).await?;

        if actual != expected {
            return Err(UpdaterError::ChecksumMismatch {
                expected,
                actual,
            }
            .into());
        }

        debug!(target: "upgrade", "Checksum verification successful");
        Ok(())
    }

    /// Size check against the size advertised by the release.
    pub async fn verify_size(file_path: &Path, expected: u64) -> Result<()> {
        let actual = tokio::fs::metadata(file_path)
            .await
            .with_context(|| format!("Failed to stat {}", file_path.display()))?
            .len();
        if actual != expected {
            return Err(UpdaterError::DownloadFailed {
                url: file_path.display().to_string(),
                attempts: 1,
                reason: format!("expected {expected} bytes, got {actual}"),
            }
            .into());
        }
        Ok(())
    }

    /// Find the digest for `file_name` in a `sha256sum`-style listing.
    pub fn find_in_listing(listing: &str, file_name: &str) -> Option<String> {
        listing.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            let checksum = parts.next()?;
            // sha256sum marks binary mode with a leading '*'
            let name = parts.next()?.trim_start_matches('*');
            (name == file_name || name.ends_with(&format!("/{file_name}")))
                .then(|| Self::normalize(checksum))
        })
    }

    pub async fn fetch_expected_checksum(
        client: &reqwest::Client,
        checksums_url: &str,
        file_name: &str,
    ) -> Result<Option<String>> {
        debug!(target: "upgrade", "Fetching checksums from: {}", checksums_url);

        let response =
            client.get(checksums_url).send().await.context("Failed to fetch checksums file")?;

        if !response.status().is_success() {
            warn!(target: "upgrade", "Failed to fetch checksums file: HTTP {}", response.status());
            return Ok(None);
        }

        let content = response.text().await.context("Failed to read checksums file content")?;
        let found = Self::find_in_listing(&content, file_name);
        if found.is_none() {
            warn!(target: "upgrade", "No checksum found for: {}", file_name);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_compute_sha256() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Hello, World!").unwrap();

        let checksum = ChecksumVerifier::compute_sha256(temp_file.path()).await.unwrap();
        assert_eq!(
            checksum,
            "sha256:dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[tokio::test]
    async fn test_verify_checksum_accepts_bare_uppercase_hex() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Hello, World!").unwrap();

        ChecksumVerifier::verify_checksum(
            temp_file.path(),
            "DFFD6021BB2BD5B0AF676290809EC3A53191DD81C7F70A4B28688A362182986F",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_verify_checksum_mismatch_is_typed() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Test content").unwrap();

        let err = ChecksumVerifier::verify_checksum(temp_file.path(), "sha256:00")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_size() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"12345").unwrap();

        ChecksumVerifier::verify_size(temp_file.path(), 5).await.unwrap();
        assert!(ChecksumVerifier::verify_size(temp_file.path(), 6).await.is_err());
    }

    #[test]
    fn test_find_in_listing() {
        let listing = "abc123  multi-updater-1.0.zip\nDEF456 *other.zip\n";
        assert_eq!(
            ChecksumVerifier::find_in_listing(listing, "multi-updater-1.0.zip").as_deref(),
            Some("sha256:abc123")
        );
        assert_eq!(
            ChecksumVerifier::find_in_listing(listing, "other.zip").as_deref(),
            Some("sha256:def456")
        );
        assert!(ChecksumVerifier::find_in_listing(listing, "multi-updater").is_none());
    }
}
