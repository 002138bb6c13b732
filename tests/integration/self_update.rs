//! The self-update pipeline end to end: lock, resolve, fetch a zip, install.

use anyhow::Result;
use multi_updater::constants::{ENTRY_SCRIPT, VERSION_FILE};
use multi_updater::core::UpdaterError;
use multi_updater::lock::UpdateLock;
use multi_updater::test_utils::{
    FakeVersionSource, LocalFetcher, ZipBuilder, install_tree, release_zip, snapshot,
};
use multi_updater::upgrade::source::ResolverConfig;
use multi_updater::upgrade::{
    AtomicInstaller, CancelFlag, InstallStage, Recovery, SelfUpdateOutcome, SelfUpdater,
    UpdateEvent, UpdateSourceResolver,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const PROJECT: &str = "app";

/// An installation of "old" at version 1.0.0, and a release zip of "new".
struct Fixture {
    root: TempDir,
    downloads: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        install_tree(&root.path().join(PROJECT), "old");
        std::fs::write(root.path().join(VERSION_FILE), "1.0.0\n").unwrap();
        Self {
            root,
            downloads: TempDir::new().unwrap(),
        }
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    fn live(&self) -> PathBuf {
        self.root().join(PROJECT)
    }

    fn release(&self, version: &str) -> PathBuf {
        let zip = self.downloads.path().join(format!("{version}.zip"));
        release_zip(&zip, PROJECT, version, "new");
        zip
    }

    fn updater(&self, source: FakeVersionSource) -> SelfUpdater<FakeVersionSource, LocalFetcher> {
        let resolver =
            UpdateSourceResolver::new(ResolverConfig::new(self.root(), PROJECT), LocalFetcher);
        SelfUpdater::new(
            source,
            resolver,
            AtomicInstaller::new(self.root(), PROJECT),
            UpdateLock::new(self.root()),
            self.live(),
        )
    }

    /// Entries at the install root other than the live dir and its files.
    fn leftovers(&self) -> Vec<String> {
        std::fs::read_dir(self.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| {
                name.contains(".backup.") || name.contains(".old.") || name.contains("-staging-")
                    || name == ".update.lock"
                    || name == ".update.lock.d"
            })
            .collect()
    }
}

fn recorder() -> (Arc<Mutex<Vec<UpdateEvent>>>, Arc<multi_updater::upgrade::UpdateEventFn>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, Arc::new(move |event| sink.lock().unwrap().push(event)))
}

#[tokio::test]
async fn test_archive_update_replaces_installation() -> Result<()> {
    multi_updater::test_utils::init_test_logging(None);
    let fixture = Fixture::new();
    let zip = fixture.release("1.1.0");
    let (events, sink) = recorder();

    let outcome = fixture
        .updater(FakeVersionSource::local("v1.1.0", &zip))
        .update(None, &CancelFlag::new(), sink)
        .await?;

    match outcome {
        SelfUpdateOutcome::Updated {
            from,
            to,
            backup_removed,
        } => {
            assert_eq!(from.as_deref(), Some("1.0.0"));
            assert_eq!(to, "1.1.0");
            assert!(backup_removed);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let entry = fixture.live().join(ENTRY_SCRIPT);
    assert_eq!(std::fs::read_to_string(&entry)?, "#!/bin/bash\necho new\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(std::fs::metadata(&entry)?.permissions().mode() & 0o777, 0o755);
    }
    assert_eq!(std::fs::read_to_string(fixture.root().join(VERSION_FILE))?, "1.1.0\n");
    assert_eq!(std::fs::read_to_string(fixture.root().join("LICENSE"))?, "MIT new\n");
    assert!(fixture.leftovers().is_empty(), "leftovers: {:?}", fixture.leftovers());

    let stages: Vec<InstallStage> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::Stage(stage) => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            InstallStage::BackedUp,
            InstallStage::PermissionsSet,
            InstallStage::Swapped,
            InstallStage::Verified,
            InstallStage::Finalized,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_same_version_is_not_reinstalled_unless_forced() -> Result<()> {
    let fixture = Fixture::new();
    let zip = fixture.release("1.0.0");

    let outcome = fixture
        .updater(FakeVersionSource::local("1.0.0", &zip))
        .update(None, &CancelFlag::new(), Arc::new(|_| {}))
        .await?;
    assert!(matches!(outcome, SelfUpdateOutcome::UpToDate { .. }));
    assert_eq!(
        std::fs::read_to_string(fixture.live().join(ENTRY_SCRIPT))?,
        "#!/bin/bash\necho old\n"
    );

    let outcome = fixture
        .updater(FakeVersionSource::local("1.0.0", &zip))
        .force(true)
        .update(None, &CancelFlag::new(), Arc::new(|_| {}))
        .await?;
    assert!(matches!(outcome, SelfUpdateOutcome::Updated { .. }));
    assert_eq!(
        std::fs::read_to_string(fixture.live().join(ENTRY_SCRIPT))?,
        "#!/bin/bash\necho new\n"
    );
    Ok(())
}

#[tokio::test]
async fn test_incomplete_release_is_rolled_back() -> Result<()> {
    let fixture = Fixture::new();
    let before = snapshot(&fixture.live());

    // Has the entry script, so it stages, but lacks gui/main.py
    let zip = fixture.downloads.path().join("broken.zip");
    ZipBuilder::new()
        .executable(&format!("repo-2.0.0/{PROJECT}/{ENTRY_SCRIPT}"), "#!/bin/bash\necho broken\n")
        .file(&format!("repo-2.0.0/{PROJECT}/lib/i18n.sh"), "# i18n\n")
        .write_to(&zip);

    let outcome = fixture
        .updater(FakeVersionSource::local("2.0.0", &zip))
        .update(None, &CancelFlag::new(), Arc::new(|_| {}))
        .await?;

    match outcome {
        SelfUpdateOutcome::RolledBack {
            reason: UpdaterError::VerificationFailed {
                missing,
            },
            recovery,
        } => {
            assert!(missing.iter().any(|m| m == "gui/main.py"), "{missing:?}");
            assert_eq!(recovery, Recovery::RestoredFromBackup);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(snapshot(&fixture.live()), before);
    assert_eq!(std::fs::read_to_string(fixture.root().join(VERSION_FILE))?, "1.0.0\n");
    assert!(fixture.leftovers().is_empty(), "leftovers: {:?}", fixture.leftovers());
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_fetch_changes_nothing() -> Result<()> {
    let fixture = Fixture::new();
    let zip = fixture.release("1.1.0");
    let before = snapshot(&fixture.live());

    let cancel = CancelFlag::new();
    cancel.cancel();
    let outcome = fixture
        .updater(FakeVersionSource::local("1.1.0", &zip))
        .update(None, &cancel, Arc::new(|_| {}))
        .await?;

    assert!(matches!(outcome, SelfUpdateOutcome::Cancelled));
    assert_eq!(snapshot(&fixture.live()), before);
    assert!(fixture.leftovers().is_empty(), "leftovers: {:?}", fixture.leftovers());
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_install_restores_previous_tree() -> Result<()> {
    let fixture = Fixture::new();
    let zip = fixture.release("1.1.0");
    let before = snapshot(&fixture.live());

    let cancel = CancelFlag::new();
    let events: Arc<multi_updater::upgrade::UpdateEventFn> = {
        let cancel = cancel.clone();
        Arc::new(move |event| {
            if event == UpdateEvent::Stage(InstallStage::Swapped) {
                cancel.cancel();
            }
        })
    };

    let outcome = fixture
        .updater(FakeVersionSource::local("1.1.0", &zip))
        .update(None, &cancel, events)
        .await?;

    assert!(matches!(outcome, SelfUpdateOutcome::Cancelled), "{outcome:?}");
    assert_eq!(snapshot(&fixture.live()), before);
    assert_eq!(std::fs::read_to_string(fixture.root().join(VERSION_FILE))?, "1.0.0\n");
    assert!(fixture.leftovers().is_empty(), "leftovers: {:?}", fixture.leftovers());
    Ok(())
}

#[tokio::test]
async fn test_install_from_local_archive() -> Result<()> {
    let fixture = Fixture::new();
    let zip = fixture.release("1.5.0");

    // The source would offer something else; the local file wins
    let other = fixture.release("9.9.9");
    let outcome = fixture
        .updater(FakeVersionSource::local("9.9.9", &other))
        .install_archive(&zip, "1.5.0", &CancelFlag::new(), Arc::new(|_| {}))
        .await?;

    assert!(matches!(outcome, SelfUpdateOutcome::Updated { ref to, .. } if to == "1.5.0"));
    assert_eq!(std::fs::read_to_string(fixture.root().join(VERSION_FILE))?, "1.5.0\n");
    Ok(())
}

#[tokio::test]
async fn test_user_config_survives_update() -> Result<()> {
    let fixture = Fixture::new();
    std::fs::write(fixture.live().join("config.conf"), "ENABLE_AUR_UPDATE=false\n")?;
    let zip = fixture.release("1.1.0");

    fixture
        .updater(FakeVersionSource::local("1.1.0", &zip))
        .update(None, &CancelFlag::new(), Arc::new(|_| {}))
        .await?;

    // The release ships only the example; the user's file is carried over
    assert_eq!(
        std::fs::read_to_string(fixture.live().join("config.conf"))?,
        "ENABLE_AUR_UPDATE=false\n"
    );
    Ok(())
}
