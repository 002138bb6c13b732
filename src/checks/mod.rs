//! Parallel "is there an update?" queries against each package source.
//!
//! Every source is probed independently: a missing package manager or a
//! hanging helper produces a failed [`SourceReport`] for that source only.
//! [`spawn_checks`] runs one task per probe and yields reports in completion
//! order, so a caller can render each source as soon as it answers.
//!
//! ```rust,no_run
//! use multi_updater::checks::{default_probes, spawn_checks};
//! use multi_updater::config::GlobalConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GlobalConfig::load().await?;
//! let mut reports = spawn_checks(default_probes(&config)?);
//! while let Some(report) = reports.recv().await {
//!     println!("{}: {}", report.source, report.summary());
//! }
//! # Ok(())
//! # }
//! ```

mod command;
mod script;

pub use command::CommandListProbe;
pub use script::{ScriptVersionProbe, is_valid_function_name};

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GlobalConfig;
use crate::constants::{ADGUARD_VERSION_FUNCTION, CURSOR_VERSION_FUNCTION};

/// A place updates come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageSource {
    System,
    Aur,
    Cursor,
    AdGuard,
    Flatpak,
}

impl PackageSource {
    pub const ALL: [Self; 5] = [Self::System, Self::Aur, Self::Cursor, Self::AdGuard, Self::Flatpak];

    pub const fn name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Aur => "aur",
            Self::Cursor => "cursor",
            Self::AdGuard => "adguard",
            Self::Flatpak => "flatpak",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::System => "System packages",
            Self::Aur => "AUR packages",
            Self::Cursor => "Cursor",
            Self::AdGuard => "AdGuard Home",
            Self::Flatpak => "Flatpak",
        }
    }
}

impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The answer from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: PackageSource,
    pub has_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub package_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    /// A package list; empty means up to date.
    pub fn packages(source: PackageSource, package_names: Vec<String>) -> Self {
        Self {
            source,
            has_update: !package_names.is_empty(),
            current_version: None,
            available_version: None,
            package_count: Some(package_names.len()),
            package_names,
            error: None,
        }
    }

    /// An installed/available version pair.
    pub fn versions(source: PackageSource, current: Option<String>, available: Option<String>) -> Self {
        let has_update = match (&current, &available) {
            (Some(current), Some(available)) => crate::upgrade::is_newer(available, current),
            (None, Some(_)) => true,
            _ => false,
        };
        Self {
            source,
            has_update,
            current_version: current,
            available_version: available,
            package_count: None,
            package_names: Vec::new(),
            error: None,
        }
    }

    pub fn failed(source: PackageSource, error: impl Into<String>) -> Self {
        Self {
            source,
            has_update: false,
            current_version: None,
            available_version: None,
            package_count: None,
            package_names: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return format!("error: {error}");
        }
        match (self.package_count, &self.current_version, &self.available_version) {
            (Some(0), ..) => "up to date".to_string(),
            (Some(1), ..) => "1 update".to_string(),
            (Some(n), ..) => format!("{n} updates"),
            (None, current, Some(available)) if self.has_update => format!(
                "{} -> {available}",
                current.as_deref().unwrap_or("not installed")
            ),
            (None, Some(current), _) => format!("up to date ({current})"),
            (None, None, _) => "not installed".to_string(),
        }
    }
}

/// An independently failing update query for one source.
pub trait SourceProbe: Send + Sync {
    fn source(&self) -> PackageSource;

    /// Never fails: problems are reported through [`SourceReport::error`].
    fn probe(&self) -> BoxFuture<'_, SourceReport>;

    /// Upper bound on [`probe`](Self::probe); the report becomes an error past it.
    fn timeout(&self) -> Duration {
        crate::constants::SOURCE_CHECK_TIMEOUT
    }
}

/// Probe every source concurrently. The receiver yields exactly one report
/// per probe, in completion order, and closes after the last.
pub fn spawn_checks(probes: Vec<Arc<dyn SourceProbe>>) -> mpsc::Receiver<SourceReport> {
    let (tx, rx) = mpsc::channel(probes.len().max(1));

    for probe in probes {
        let tx = tx.clone();
        tokio::spawn(async move {
            let source = probe.source();
            let limit = probe.timeout();
            let task = {
                let probe = Arc::clone(&probe);
                tokio::spawn(async move { tokio::time::timeout(limit, probe.probe()).await })
            };

            let report = match task.await {
                Ok(Ok(report)) => report,
                Ok(Err(_)) => SourceReport::failed(
                    source,
                    format!("Timeout checking {} after {}s", source.name(), limit.as_secs()),
                ),
                Err(e) => {
                    warn!(target: "checks", "Probe for {} aborted: {}", source.name(), e);
                    SourceReport::failed(source, format!("check aborted: {e}"))
                }
            };
            debug!(target: "checks", "{}: {}", source.name(), report.summary());
            // The receiver may have gone away; nothing else to do with the report
            let _ = tx.send(report).await;
        });
    }

    rx
}

/// Probes for the sources enabled in `config`.
pub fn default_probes(config: &GlobalConfig) -> Result<Vec<Arc<dyn SourceProbe>>> {
    let components = &config.components;
    let script = config.script_path()?;
    let mut probes: Vec<Arc<dyn SourceProbe>> = Vec::new();

    if components.system {
        probes.push(Arc::new(CommandListProbe::system()));
    }
    if components.aur {
        probes.push(Arc::new(CommandListProbe::aur()));
    }
    if components.cursor {
        probes.push(Arc::new(ScriptVersionProbe::new(
            PackageSource::Cursor,
            &script,
            CURSOR_VERSION_FUNCTION,
        )));
    }
    if components.adguard {
        probes.push(Arc::new(ScriptVersionProbe::new(
            PackageSource::AdGuard,
            &script,
            ADGUARD_VERSION_FUNCTION,
        )));
    }
    if components.flatpak {
        probes.push(Arc::new(CommandListProbe::flatpak()));
    }

    Ok(probes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComponentToggles;

    struct FixedProbe {
        source: PackageSource,
        delay: Duration,
        report: SourceReport,
    }

    impl SourceProbe for FixedProbe {
        fn source(&self) -> PackageSource {
            self.source
        }

        fn probe(&self) -> BoxFuture<'_, SourceReport> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.report.clone()
            })
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(500)
        }
    }

    struct PanickingProbe;

    impl SourceProbe for PanickingProbe {
        fn source(&self) -> PackageSource {
            PackageSource::Flatpak
        }

        fn probe(&self) -> BoxFuture<'_, SourceReport> {
            Box::pin(async { panic!("probe blew up") })
        }
    }

    fn fixed(source: PackageSource, delay_ms: u64, names: &[&str]) -> Arc<dyn SourceProbe> {
        Arc::new(FixedProbe {
            source,
            delay: Duration::from_millis(delay_ms),
            report: SourceReport::packages(source, names.iter().map(ToString::to_string).collect()),
        })
    }

    #[tokio::test]
    async fn test_reports_arrive_in_completion_order() {
        let mut rx = spawn_checks(vec![
            fixed(PackageSource::System, 200, &["linux"]),
            fixed(PackageSource::Aur, 10, &[]),
        ]);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.source, PackageSource::Aur);
        assert!(!first.has_update);
        assert_eq!(second.source, PackageSource::System);
        assert_eq!(second.package_names, vec!["linux"]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_probe_times_out_without_blocking_others() {
        let mut rx = spawn_checks(vec![
            fixed(PackageSource::Cursor, 5_000, &["never"]),
            fixed(PackageSource::Flatpak, 0, &["org.app"]),
        ]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.source, PackageSource::Flatpak);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.source, PackageSource::Cursor);
        assert!(second.error.as_deref().unwrap().contains("Timeout checking cursor"));
    }

    #[tokio::test]
    async fn test_panicking_probe_still_reports() {
        let mut rx = spawn_checks(vec![Arc::new(PanickingProbe)]);
        let report = rx.recv().await.unwrap();
        assert_eq!(report.source, PackageSource::Flatpak);
        assert!(report.is_error());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_no_probes_closes_immediately() {
        let mut rx = spawn_checks(Vec::new());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_default_probes_follow_toggles() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = GlobalConfig {
            script_dir: Some(dir.path().to_path_buf()),
            components: ComponentToggles {
                aur: false,
                adguard: false,
                ..Default::default()
            },
            ..Default::default()
        };

        let sources: Vec<_> =
            default_probes(&config).unwrap().iter().map(|p| p.source()).collect();
        assert_eq!(
            sources,
            vec![PackageSource::System, PackageSource::Cursor, PackageSource::Flatpak]
        );
    }

    #[test]
    fn test_version_report() {
        let report = SourceReport::versions(
            PackageSource::Cursor,
            Some("1.0.0".into()),
            Some("1.1.0".into()),
        );
        assert!(report.has_update);
        assert_eq!(report.summary(), "1.0.0 -> 1.1.0");

        let same = SourceReport::versions(PackageSource::Cursor, Some("1.1.0".into()), Some("1.1.0".into()));
        assert!(!same.has_update);
        assert_eq!(same.summary(), "up to date (1.1.0)");
    }

    #[test]
    fn test_package_summary() {
        assert_eq!(SourceReport::packages(PackageSource::System, vec![]).summary(), "up to date");
        assert_eq!(
            SourceReport::packages(PackageSource::System, vec!["a".into(), "b".into()]).summary(),
            "2 updates"
        );
        assert_eq!(SourceReport::failed(PackageSource::Aur, "x").summary(), "error: x");
    }
}
