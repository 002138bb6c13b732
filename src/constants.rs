//! Global constants used throughout the updater.
//!
//! Timeouts, retry budgets, file-layout names and the fixed file sets the
//! installer relies on. Values a user may want to tune live in
//! [`crate::config::GlobalConfig`] instead; the defaults there come from here.

use std::time::Duration;

/// Name of the update script driven by the supervisor.
pub const ENTRY_SCRIPT: &str = "update-all.sh";

/// Directory name of the installation inside the install root.
pub const PROJECT_DIR_NAME: &str = "cachyos-multi-updater";

/// Default GitHub repository used as the version source.
pub const DEFAULT_REPOSITORY: &str = "benjarogit/sc-cachyos-multi-updater";

/// Name of the version marker written at the install root.
pub const VERSION_FILE: &str = "VERSION";

/// Lock file name; the transient mutex directory is this name plus `.d`.
pub const LOCK_FILE_NAME: &str = ".update.lock";

/// Entry points that must stay executable after an install.
pub const EXECUTABLE_FILES: &[&str] =
    &["update-all.sh", "setup.sh", "cachyos-update", "cachyos-update-gui", "run-update.sh"];

/// Subdirectories whose script files are made executable after an install.
pub const SCRIPT_DIRECTORIES: &[&str] = &["lib", "gui"];

/// Files whose absence after the swap means the installation is broken.
pub const CRITICAL_FILES: &[&str] = &["update-all.sh", "gui/main.py", "gui/window.py", "lib/i18n.sh"];

/// Top-level files copied next to the installation after a successful install.
///
/// Only documentation; nothing here may overwrite user configuration.
pub const AUXILIARY_FILES: &[&str] = &["LICENSE", "README.md", "CHANGELOG.md"];

/// User files inside the live directory that an install carries over into
/// the new tree. Releases ship only `config.conf.example`.
pub const PRESERVED_FILES: &[&str] = &["config.conf"];

/// Mode applied to every file in [`EXECUTABLE_FILES`] and to scripts in
/// [`SCRIPT_DIRECTORIES`].
pub const EXECUTABLE_MODE: u32 = 0o755;

/// Mode of the temporary credential shim (owner read/execute only).
pub const SHIM_MODE: u32 = 0o500;

/// Longest password accepted on stdin, in bytes.
pub const MAX_CREDENTIAL_LEN: usize = 4096;

/// Bounded wait for a child process to be confirmed as started (5 seconds).
pub const PROCESS_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for a killed child to be reaped (5 seconds).
pub const PROCESS_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Window after spawn in which an immediate exit is treated as a start failure.
pub const START_CONFIRMATION_WINDOW: Duration = Duration::from_millis(150);

/// Pause between re-checks when a spawn call returned an ambiguous error.
pub const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Size of each read from the child's stdout/stderr.
pub const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;

/// Capacity of the session event channel.
///
/// Readers block once the subscriber falls this far behind, so the child is
/// throttled by the pipe instead of the supervisor buffering its output.
pub const SESSION_EVENT_CAPACITY: usize = 256;

/// Download attempts before a transfer failure is surfaced.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;

/// Fixed delay between download attempts (2 seconds).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Timeout for release metadata requests (10 seconds).
pub const HTTP_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a full archive download (5 minutes).
pub const HTTP_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Default reachability probe target (a public DNS resolver).
pub const DEFAULT_NETWORK_CHECK_HOST: &str = "8.8.8.8";

/// Default reachability probe port.
pub const DEFAULT_NETWORK_CHECK_PORT: u16 = 53;

/// Default reachability probe timeout (3 seconds).
pub const DEFAULT_NETWORK_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for `git pull` and revision queries (2 minutes).
pub const GIT_PULL_TIMEOUT: Duration = Duration::from_secs(120);

/// Number of backups kept by the retention policy.
pub const DEFAULT_BACKUP_KEEP: usize = 3;

/// Age after which a backup is always deleted (7 days).
pub const DEFAULT_BACKUP_MAX_AGE_DAYS: u32 = 7;

/// Mutex directories older than this belong to a crashed acquirer (30 seconds).
pub const LOCK_MUTEX_STALE_AFTER: Duration = Duration::from_secs(30);

/// Timeout for a single package-source probe (30 seconds).
pub const SOURCE_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum depth searched for the project folder inside an extracted archive.
pub const PROJECT_SEARCH_DEPTH: usize = 3;

/// Timestamp format used in backup and side-path names.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Update-script function printing the installed and available editor versions.
pub const CURSOR_VERSION_FUNCTION: &str = "get_cursor_versions";

/// Update-script function printing the installed and available AdGuard Home versions.
pub const ADGUARD_VERSION_FUNCTION: &str = "get_adguard_versions";
