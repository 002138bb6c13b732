//! Timestamped installation backups and their retention.
//!
//! A backup is a full copy of the live installation directory, taken before
//! the swap and named `<project>.backup.<YYYYmmddHHMMSSmmm>` next to it.
//! After a verified install the backup is deleted; the ones that survive (a
//! failed delete, a rollback) are pruned by [`BackupRetentionPolicy`]: first
//! everything older than the age limit, then all but the newest `keep`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::UpgradeConfig;
use crate::constants::{BACKUP_TIMESTAMP_FORMAT, DEFAULT_BACKUP_KEEP, DEFAULT_BACKUP_MAX_AGE_DAYS};
use crate::utils::fs::remove_dir_all;

/// Kinds of side paths created next to the live directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidePathKind {
    Backup,
    Old,
}

impl SidePathKind {
    const fn infix(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Old => "old",
        }
    }
}

/// A fresh, unused `<project>.<kind>.<timestamp>` path under `root`.
pub fn side_path(root: &Path, project: &str, kind: SidePathKind, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format(BACKUP_TIMESTAMP_FORMAT).to_string();
    let base = format!("{project}.{}.{stamp}", kind.infix());
    let mut candidate = root.join(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = root.join(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

/// One backup directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    /// Parse a backup directory name. Falls back to the directory's mtime
    /// when the timestamp part is unreadable.
    fn from_path(path: PathBuf, project: &str) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stamp = name.strip_prefix(project)?.strip_prefix(".backup.")?;
        let stamp = stamp.split('-').next().unwrap_or(stamp);

        let created_at = NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
            .map(|t| t.and_utc())
            .ok()
            .or_else(|| {
                std::fs::metadata(&path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from)
            })?;

        Some(Self {
            path,
            created_at,
        })
    }
}

/// Backups of `project` under `root`, newest first.
pub fn list_backups(root: &Path, project: &str) -> Result<Vec<Backup>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list backups in {}", root.display()));
        }
    };

    let mut backups: Vec<Backup> = entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| Backup::from_path(e.path(), project))
        .collect();
    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(backups)
}

/// Prunes backups by age, then by count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRetentionPolicy {
    pub max_age: Duration,
    pub keep: usize,
}

impl Default for BackupRetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(u64::from(DEFAULT_BACKUP_MAX_AGE_DAYS) * 86_400),
            keep: DEFAULT_BACKUP_KEEP,
        }
    }
}

impl From<&UpgradeConfig> for BackupRetentionPolicy {
    fn from(config: &UpgradeConfig) -> Self {
        Self {
            max_age: Duration::from_secs(u64::from(config.backup_max_age_days) * 86_400),
            keep: config.backup_keep,
        }
    }
}

impl BackupRetentionPolicy {
    /// Backups to delete, given all existing ones.
    pub fn plan(&self, backups: &[Backup], now: DateTime<Utc>) -> Vec<Backup> {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);

        let mut sorted = backups.to_vec();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let (expired, fresh): (Vec<_>, Vec<_>) =
            sorted.into_iter().partition(|b| now.signed_duration_since(b.created_at) > max_age);

        let mut doomed = expired;
        doomed.extend(fresh.into_iter().skip(self.keep));
        doomed
    }

    /// Delete what [`plan`](Self::plan) selects. Individual failures are
    /// logged and skipped; returns the paths actually removed.
    pub fn enforce(&self, root: &Path, project: &str) -> Result<Vec<PathBuf>> {
        let backups = list_backups(root, project)?;
        let mut removed = Vec::new();

        for backup in self.plan(&backups, Utc::now()) {
            match remove_dir_all(&backup.path) {
                Ok(()) => {
                    debug!(target: "upgrade", "Pruned backup {}", backup.path.display());
                    removed.push(backup.path);
                }
                Err(e) => {
                    warn!(target: "upgrade", "Failed to prune backup {}: {:#}", backup.path.display(), e);
                }
            }
        }

        if !removed.is_empty() {
            info!(target: "upgrade", "Pruned {} old backup(s)", removed.len());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn backup(days_ago: i64, now: DateTime<Utc>) -> Backup {
        Backup {
            path: PathBuf::from(format!("/r/app.backup.{days_ago}")),
            created_at: now - chrono::Duration::days(days_ago),
        }
    }

    #[test]
    fn test_plan_drops_expired_then_keeps_newest() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let policy = BackupRetentionPolicy {
            max_age: Duration::from_secs(7 * 86_400),
            keep: 3,
        };
        let backups: Vec<_> = [0, 1, 2, 3, 8, 30].iter().map(|d| backup(*d, now)).collect();

        let doomed = policy.plan(&backups, now);
        let mut doomed_days: Vec<_> =
            doomed.iter().map(|b| now.signed_duration_since(b.created_at).num_days()).collect();
        doomed_days.sort_unstable();
        assert_eq!(doomed_days, vec![3, 8, 30]);

        let survivors: Vec<_> = backups.iter().filter(|b| !doomed.contains(b)).collect();
        assert!(survivors.len() <= policy.keep);
        assert!(survivors.iter().all(|b| now.signed_duration_since(b.created_at).num_days() <= 7));
    }

    #[test]
    fn test_plan_keep_zero_removes_all() {
        let now = Utc::now();
        let policy = BackupRetentionPolicy {
            max_age: Duration::from_secs(86_400),
            keep: 0,
        };
        let backups = vec![backup(0, now)];
        assert_eq!(policy.plan(&backups, now).len(), 1);
    }

    #[test]
    fn test_list_and_enforce() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let path = side_path(
                temp.path(),
                "app",
                SidePathKind::Backup,
                now - chrono::Duration::minutes(i),
            );
            std::fs::create_dir(&path).unwrap();
        }
        std::fs::create_dir(temp.path().join("app")).unwrap();
        std::fs::create_dir(temp.path().join("other.backup.20200101000000000")).unwrap();

        let listed = list_backups(temp.path(), "app").unwrap();
        assert_eq!(listed.len(), 5);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let removed = BackupRetentionPolicy::default().enforce(temp.path(), "app").unwrap();
        assert_eq!(removed.len(), 2);
        let remaining = list_backups(temp.path(), "app").unwrap();
        assert_eq!(remaining, listed[..3].to_vec());
        assert!(temp.path().join("other.backup.20200101000000000").exists());
    }

    #[test]
    fn test_side_path_is_unique() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        let first = side_path(temp.path(), "app", SidePathKind::Old, now);
        std::fs::create_dir(&first).unwrap();
        let second = side_path(temp.path(), "app", SidePathKind::Old, now);
        assert_ne!(first, second);
        assert!(second.file_name().unwrap().to_str().unwrap().starts_with("app.old."));
    }
}
