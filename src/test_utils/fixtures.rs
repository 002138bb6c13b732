//! Filesystem fixtures: installation trees, zips and snapshots.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::constants::ENTRY_SCRIPT;
use crate::upgrade::source::StagingDirectory;

/// Files of a minimal installation, relative to the live directory.
/// `marker` ends up in every file so trees can be told apart.
fn tree_files(marker: &str) -> Vec<(String, String, bool)> {
    vec![
        (ENTRY_SCRIPT.to_string(), format!("#!/bin/bash\necho {marker}\n"), true),
        ("setup.sh".to_string(), format!("#!/bin/bash\n# {marker}\n"), true),
        ("lib/i18n.sh".to_string(), format!("# i18n {marker}\n"), false),
        ("gui/main.py".to_string(), format!("print('{marker}')\n"), false),
        ("gui/window.py".to_string(), format!("# window {marker}\n"), false),
        ("config.conf.example".to_string(), format!("ENABLE_AUR_UPDATE=true # {marker}\n"), false),
    ]
}

/// Write a minimal installation into `dir`.
pub fn install_tree(dir: &Path, marker: &str) {
    for (rel, content, executable) in tree_files(marker) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if executable { 0o755 } else { 0o644 };
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = executable;
    }
}

/// A staged tree for `version` under `root`, laid out like an extracted
/// release archive (`repo-<version>/<project>/...` plus a LICENSE).
/// Modes are left at the umask default, as extraction would.
pub fn staging_from_tree(root: &Path, project: &str, version: &str, marker: &str) -> StagingDirectory {
    let temp = StagingDirectory::temp_in(root, project).unwrap();
    let archive_root = temp.path().join("extracted").join(format!("repo-{version}"));
    let project_dir = archive_root.join(project);
    for (rel, content, _) in tree_files(marker) {
        let path = project_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
    }
    std::fs::write(archive_root.join("LICENSE"), format!("MIT {marker}\n")).unwrap();
    StagingDirectory::from_extracted(temp, project, version).unwrap()
}

/// A release zip for `version` at `path`, with the same layout as
/// [`staging_from_tree`].
pub fn release_zip(path: &Path, project: &str, version: &str, marker: &str) {
    let base = format!("repo-{version}");
    let mut builder = ZipBuilder::new().file(&format!("{base}/LICENSE"), &format!("MIT {marker}\n"));
    for (rel, content, _) in tree_files(marker) {
        builder = builder.file(&format!("{base}/{project}/{rel}"), &content);
    }
    builder.write_to(path);
}

/// Builds zip archives in memory.
#[derive(Debug, Default)]
pub struct ZipBuilder {
    entries: Vec<(String, Vec<u8>, u32)>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, name: &str, content: &str) -> Self {
        self.entries.push((name.to_string(), content.as_bytes().to_vec(), 0o644));
        self
    }

    pub fn executable(mut self, name: &str, content: &str) -> Self {
        self.entries.push((name.to_string(), content.as_bytes().to_vec(), 0o755));
        self
    }

    pub fn write_to(self, path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content, mode) in self.entries {
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(mode);
            zip.start_file(name, options).unwrap();
            zip.write_all(&content).unwrap();
        }
        zip.finish().unwrap();
    }
}

/// Write an executable bash script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Everything under `dir`: relative path to (mode, contents). Directories
/// map to empty contents. Empty when `dir` does not exist.
pub fn snapshot(dir: &Path) -> BTreeMap<PathBuf, (u32, Vec<u8>)> {
    let mut map = BTreeMap::new();
    if !dir.exists() {
        return map;
    }
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(dir).unwrap().to_path_buf();
        let meta = entry.path().symlink_metadata().unwrap();
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = u32::from(meta.permissions().readonly());
        let content = if meta.is_file() {
            std::fs::read(entry.path()).unwrap()
        } else if meta.file_type().is_symlink() {
            std::fs::read_link(entry.path()).unwrap().to_string_lossy().as_bytes().to_vec()
        } else {
            Vec::new()
        };
        map.insert(rel, (mode, content));
    }
    map
}
