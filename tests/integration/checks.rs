//! Package-source probes run together through `spawn_checks`.

use multi_updater::checks::{
    CommandListProbe, PackageSource, ScriptVersionProbe, SourceProbe, SourceReport, spawn_checks,
};
use multi_updater::test_utils::write_script;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[cfg(unix)]
#[tokio::test]
async fn test_every_source_reports_once_even_when_some_fail() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "update-all.sh",
        r#"#!/bin/bash
get_cursor_versions() { echo 0.40.1; echo 0.41.0; }
get_adguard_versions() { sleep 10; }
"#,
    );

    let probes: Vec<Arc<dyn SourceProbe>> = vec![
        Arc::new(CommandListProbe::new(
            PackageSource::System,
            [vec!["printf", "linux 6.1 -> 6.2\nmesa 1 -> 2\n"]],
        )),
        Arc::new(CommandListProbe::new(PackageSource::Aur, [["no-such-aur-helper-xyz", "-Qua"]])),
        Arc::new(ScriptVersionProbe::new(PackageSource::Cursor, &script, "get_cursor_versions")),
        Arc::new(
            ScriptVersionProbe::new(PackageSource::AdGuard, &script, "get_adguard_versions")
                .with_timeout(Duration::from_millis(300)),
        ),
        Arc::new(CommandListProbe::new(PackageSource::Flatpak, [["true"]])),
    ];

    let mut rx = spawn_checks(probes);
    let mut reports: BTreeMap<PackageSource, SourceReport> = BTreeMap::new();
    while let Some(report) = rx.recv().await {
        assert!(reports.insert(report.source, report).is_none(), "duplicate report");
    }
    assert_eq!(reports.len(), 5);

    let system = &reports[&PackageSource::System];
    assert!(system.has_update);
    assert_eq!(system.package_names, vec!["linux", "mesa"]);

    let aur = &reports[&PackageSource::Aur];
    assert_eq!(aur.error.as_deref(), Some("no-such-aur-helper-xyz not found"));

    let cursor = &reports[&PackageSource::Cursor];
    assert!(cursor.has_update);
    assert_eq!(cursor.available_version.as_deref(), Some("0.41.0"));

    let adguard = &reports[&PackageSource::AdGuard];
    assert!(adguard.error.as_deref().unwrap().starts_with("Timeout checking adguard"));

    let flatpak = &reports[&PackageSource::Flatpak];
    assert!(!flatpak.has_update);
    assert_eq!(flatpak.error, None);
}
