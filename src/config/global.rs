//! Global configuration for the updater.
//!
//! A single TOML file holds user-wide settings: where the update script
//! lives, which package sources the script should touch, and how self-updates
//! are fetched and retained.
//!
//! # Configuration File Location
//!
//! - `$MULTI_UPDATER_CONFIG` when set
//! - otherwise `<config_dir>/multi-updater/config.toml`
//!   (`~/.config/multi-updater/config.toml` on Linux)
//!
//! A missing file is not an error; every field has a default.
//!
//! # File Format
//!
//! ```toml
//! script_dir = "/opt/cachyos/cachyos-multi-updater"
//!
//! [components]
//! system = true
//! aur = true
//! cursor = false
//! adguard = false
//! flatpak = true
//!
//! [upgrade]
//! repo = "benjarogit/sc-cachyos-multi-updater"
//! download_retries = 3
//! retry_delay_secs = 2
//! backup_keep = 3
//! backup_max_age_days = 7
//!
//! [network]
//! enabled = true
//! check_host = "8.8.8.8"
//! check_port = 53
//! check_timeout_secs = 3
//! ```

use crate::constants::{
    DEFAULT_BACKUP_KEEP, DEFAULT_BACKUP_MAX_AGE_DAYS, DEFAULT_DOWNLOAD_RETRIES,
    DEFAULT_NETWORK_CHECK_HOST, DEFAULT_NETWORK_CHECK_PORT, DEFAULT_NETWORK_CHECK_TIMEOUT,
    DEFAULT_REPOSITORY, DEFAULT_RETRY_DELAY, ENTRY_SCRIPT,
};
use crate::core::UpdaterError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "MULTI_UPDATER_CONFIG";

/// User-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    /// Directory containing `update-all.sh`. Defaults to the directory of
    /// the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_dir: Option<PathBuf>,

    /// Which package sources the update script should handle.
    #[serde(default)]
    pub components: ComponentToggles,

    /// Self-update settings.
    #[serde(default)]
    pub upgrade: UpgradeConfig,

    /// Reachability probe run before archive downloads.
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Per-source enable flags, exported to the script as `ENABLE_*_UPDATE`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentToggles {
    #[serde(default = "enabled")]
    pub system: bool,
    #[serde(default = "enabled")]
    pub aur: bool,
    #[serde(default = "enabled")]
    pub cursor: bool,
    #[serde(default = "enabled")]
    pub adguard: bool,
    #[serde(default = "enabled")]
    pub flatpak: bool,
}

impl Default for ComponentToggles {
    fn default() -> Self {
        Self {
            system: true,
            aur: true,
            cursor: true,
            adguard: true,
            flatpak: true,
        }
    }
}

impl ComponentToggles {
    /// Environment variables understood by the update script.
    ///
    /// ```rust
    /// use multi_updater::config::ComponentToggles;
    ///
    /// let toggles = ComponentToggles { cursor: false, ..Default::default() };
    /// let env = toggles.env_overrides();
    /// assert_eq!(env["ENABLE_CURSOR_UPDATE"], "false");
    /// assert_eq!(env["ENABLE_SYSTEM_UPDATE"], "true");
    /// ```
    #[must_use]
    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        [
            ("ENABLE_SYSTEM_UPDATE", self.system),
            ("ENABLE_AUR_UPDATE", self.aur),
            ("ENABLE_CURSOR_UPDATE", self.cursor),
            ("ENABLE_ADGUARD_UPDATE", self.adguard),
            ("ENABLE_FLATPAK_UPDATE", self.flatpak),
        ]
        .into_iter()
        .map(|(key, on)| (key.to_string(), on.to_string()))
        .collect()
    }
}

/// Self-update settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// GitHub `owner/name` of the release repository.
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Download attempts before giving up.
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,

    /// Fixed delay between download attempts, in seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Backups kept after a successful install.
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,

    /// Backups older than this are always deleted.
    #[serde(default = "default_backup_max_age_days")]
    pub backup_max_age_days: u32,

    /// Directory holding `.update.lock`. Defaults to the install root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,

    #[serde(default)]
    pub check_on_startup: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            download_retries: default_download_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            backup_keep: default_backup_keep(),
            backup_max_age_days: default_backup_max_age_days(),
            lock_dir: None,
            check_on_startup: false,
        }
    }
}

impl UpgradeConfig {
    /// Delay between download attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Reachability probe settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "default_check_host")]
    pub check_host: String,
    #[serde(default = "default_check_port")]
    pub check_port: u16,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_host: default_check_host(),
            check_port: default_check_port(),
            check_timeout_secs: default_check_timeout_secs(),
        }
    }
}

const fn enabled() -> bool {
    true
}

fn default_repo() -> String {
    DEFAULT_REPOSITORY.to_string()
}

const fn default_download_retries() -> u32 {
    DEFAULT_DOWNLOAD_RETRIES
}

const fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY.as_secs()
}

const fn default_backup_keep() -> usize {
    DEFAULT_BACKUP_KEEP
}

const fn default_backup_max_age_days() -> u32 {
    DEFAULT_BACKUP_MAX_AGE_DAYS
}

fn default_check_host() -> String {
    DEFAULT_NETWORK_CHECK_HOST.to_string()
}

const fn default_check_port() -> u16 {
    DEFAULT_NETWORK_CHECK_PORT
}

const fn default_check_timeout_secs() -> u64 {
    DEFAULT_NETWORK_CHECK_TIMEOUT.as_secs()
}

impl GlobalConfig {
    /// Load from the default location, or defaults when no file exists.
    pub async fn load() -> Result<Self> {
        Self::load_with_optional(None).await
    }

    /// Load from `path` when given, else from the default location.
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        if path.exists() {
            Self::load_from(&path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Load from a specific file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content).map_err(|e| {
            anyhow::Error::from(UpdaterError::ConfigError {
                file: path.display().to_string(),
                reason: e.to_string(),
            })
        })
    }

    /// Save to a specific file with owner-only permissions.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut perms = fs::metadata(path)
                .await
                .with_context(|| format!("Failed to read permissions for {}", path.display()))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms).await.with_context(|| {
                format!("Failed to set permissions on {}", path.display())
            })?;
        }

        Ok(())
    }

    /// Default configuration file path.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
            && !path.is_empty()
        {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine config directory"))?;
        Ok(config_dir.join("multi-updater").join("config.toml"))
    }

    /// Directory holding the update script.
    pub fn resolve_script_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.script_dir {
            return Ok(dir.clone());
        }
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow::anyhow!("Executable has no parent directory"))
    }

    /// Full path of the update script.
    pub fn script_path(&self) -> Result<PathBuf> {
        Ok(self.resolve_script_dir()?.join(ENTRY_SCRIPT))
    }

    /// Directory that contains the installation directory.
    ///
    /// Backups, side paths and the `VERSION` file live here.
    pub fn install_root(&self) -> Result<PathBuf> {
        let script_dir = self.resolve_script_dir()?;
        Ok(script_dir.parent().map(Path::to_path_buf).unwrap_or(script_dir))
    }

    /// Directory holding the update lock.
    pub fn lock_dir(&self) -> Result<PathBuf> {
        match &self.upgrade.lock_dir {
            Some(dir) => Ok(dir.clone()),
            None => self.install_root(),
        }
    }
}
