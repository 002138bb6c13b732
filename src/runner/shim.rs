//! The credential shim: a fixed wrapper that reads one line from stdin,
//! validates `sudo` with it, and `exec`s the real script.
//!
//! The body never contains the credential or the script path; both the
//! script and its flags reach the shim as argv. The file is owner
//! read/execute only and is removed when the [`CredentialShim`] is dropped,
//! which the session does as soon as the child has terminated.

use crate::constants::SHIM_MODE;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;
use tracing::debug;

/// Wrapper body. `printf` is a bash builtin, so the secret never shows up
/// in a process listing, and the variable is never exported.
pub const SHIM_BODY: &str = r#"#!/bin/bash
set -u
IFS= read -r UPDATER_CREDENTIAL || exit 1
if ! printf '%s\n' "$UPDATER_CREDENTIAL" | sudo -S -p '' -v; then
    unset UPDATER_CREDENTIAL
    echo "sudo authentication failed" >&2
    exit 1
fi
unset UPDATER_CREDENTIAL
exec bash "$@"
"#;

/// A temporary copy of [`SHIM_BODY`] on disk.
#[derive(Debug)]
pub struct CredentialShim {
    path: TempPath,
}

impl CredentialShim {
    /// Write the shim into the system temp directory.
    pub fn create() -> Result<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    /// Write the shim into `dir`.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(".multi-updater-shim-")
            .suffix(".sh")
            .tempfile_in(dir)
            .with_context(|| format!("Failed to create credential shim in {}", dir.display()))?;

        file.write_all(SHIM_BODY.as_bytes()).context("Failed to write credential shim")?;
        file.as_file().sync_all().context("Failed to sync credential shim")?;

        // Closing the handle before the shim runs avoids ETXTBSY
        let path = file.into_temp_path();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SHIM_MODE))
                .context("Failed to restrict credential shim permissions")?;
        }

        debug!(target: "runner", "Credential shim written to {}", path.display());
        Ok(Self {
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the shim now, reporting failures.
    pub fn remove(self) -> Result<()> {
        let display = self.path.display().to_string();
        self.path.close().with_context(|| format!("Failed to remove credential shim {display}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shim_is_written_and_removed() {
        let dir = TempDir::new().unwrap();
        let shim = CredentialShim::create_in(dir.path()).unwrap();
        let path = shim.path().to_path_buf();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), SHIM_BODY);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o500);
        }

        shim.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_shim_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = {
            let shim = CredentialShim::create_in(dir.path()).unwrap();
            shim.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_body_has_no_placeholders() {
        assert!(SHIM_BODY.contains("exec bash \"$@\""));
        assert!(!SHIM_BODY.contains("export"));
    }
}
