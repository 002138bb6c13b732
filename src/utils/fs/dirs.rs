//! Directory operations for creating, copying, and removing directory trees.
//!
//! The copy here is used for installation backups, so unlike a plain content
//! copy it keeps Unix permission bits and recreates symlinks instead of
//! following them. A restored backup must be indistinguishable from the tree
//! it was taken from.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Ensures a directory exists, creating it and all parent directories if necessary.
///
/// Fails if the path exists but is not a directory.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    } else if !path.is_dir() {
        return Err(anyhow::anyhow!("Path exists but is not a directory: {}", path.display()));
    }
    Ok(())
}

/// Recursively copies a directory tree, preserving permissions and symlinks.
///
/// `dst` must not exist yet; it is created with the same mode as `src`.
///
/// # Examples
///
/// ```rust,no_run
/// use multi_updater::utils::fs::copy_tree;
/// use std::path::Path;
///
/// # fn example() -> anyhow::Result<()> {
/// copy_tree(
///     Path::new("/opt/cachyos/cachyos-multi-updater"),
///     Path::new("/opt/cachyos/cachyos-multi-updater.backup.20250101120000000"),
/// )?;
/// # Ok(())
/// # }
/// ```
///
/// # Behavior
///
/// - Regular files are copied with `fs::copy`, which carries the mode bits
/// - Directories are created and then given the source directory's mode
/// - Symlinks are recreated pointing at the same target (never followed)
/// - Other file types (sockets, FIFOs) are skipped
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        anyhow::bail!("Copy destination already exists: {}", dst.display());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("Entry outside source tree: {}", entry.path().display()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink: {}", entry.path().display()))?;
            create_symlink(&link, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy file from {} to {}", entry.path().display(), target.display())
            })?;
        }
    }

    // Directory modes are applied last so a read-only directory does not
    // block the copies into it
    for entry in WalkDir::new(src).follow_links(false).contents_first(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        if entry.file_type().is_dir() {
            let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
            let perms = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .permissions();
            fs::set_permissions(dst.join(relative), perms)
                .with_context(|| format!("Failed to set permissions on {}", relative.display()))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)
        .with_context(|| format!("Failed to create symlink: {}", target.display()))
}

#[cfg(not(unix))]
fn create_symlink(link: &Path, target: &Path) -> Result<()> {
    let resolved = target.parent().map(|p| p.join(link)).unwrap_or_else(|| link.to_path_buf());
    if resolved.is_dir() {
        copy_tree(&resolved, target)
    } else {
        fs::copy(&resolved, target)
            .map(|_| ())
            .with_context(|| format!("Failed to copy link target: {}", resolved.display()))
    }
}

/// Recursively removes a directory and all its contents.
///
/// A missing directory is not an error.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory: {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("Failed to remove file: {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to stat: {}", path.display())),
    }
}
