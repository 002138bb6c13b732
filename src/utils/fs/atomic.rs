//! Atomic file write operations using temp-and-rename strategy.
//!
//! Readers of the target path see either the previous contents or the new
//! contents, never a partial write. Used for the `VERSION` file and the lock
//! record.

use crate::utils::fs::dirs::ensure_dir;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Safely writes a string to a file using atomic operations.
///
/// Convenience wrapper around [`atomic_write`].
pub fn safe_write(path: &Path, content: &str) -> Result<()> {
    atomic_write(path, content.as_bytes())
}

/// Atomically writes bytes to a file using a write-then-rename strategy.
///
/// 1. Write the content to a sibling temporary file
/// 2. Sync it to disk
/// 3. Rename it over the target path
///
/// The temporary name includes the process id so two processes writing the
/// same target never share a temp file. On failure the temp file is removed.
///
/// # Examples
///
/// ```rust,no_run
/// use multi_updater::utils::fs::atomic_write;
/// use std::path::Path;
///
/// # fn example() -> anyhow::Result<()> {
/// atomic_write(Path::new("/opt/cachyos/VERSION"), b"1.4.2\n")?;
/// # Ok(())
/// # }
/// ```
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }

    let temp_path = temp_sibling(path);

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        file.write_all(content)
            .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;

        file.sync_all().with_context(|| "Failed to sync file to disk")?;

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename temp file to: {}", path.display()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_basic() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("VERSION");

        atomic_write(&file, b"1.0.0\n").unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "1.0.0\n");
    }

    #[test]
    fn test_atomic_write_overwrites_and_leaves_no_temp() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("VERSION");

        safe_write(&file, "1.0.0").unwrap();
        safe_write(&file, "1.1.0").unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "1.1.0");
        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("a").join("b").join("file.txt");

        atomic_write(&file, b"nested").unwrap();
        assert!(file.exists());
    }
}
