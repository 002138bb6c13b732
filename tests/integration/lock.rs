//! The update lock as seen by separate processes.

use anyhow::Result;
use multi_updater::constants::{ENTRY_SCRIPT, VERSION_FILE};
use multi_updater::core::UpdaterError;
use multi_updater::lock::{LockAttempt, UpdateLock};
use multi_updater::test_utils::{FakeVersionSource, LocalFetcher, install_tree, release_zip};
use multi_updater::upgrade::source::ResolverConfig;
use multi_updater::upgrade::{
    AtomicInstaller, CancelFlag, SelfUpdateOutcome, SelfUpdater, UpdateSourceResolver,
};
use std::path::Path;
use std::process::{Child, Command};
use std::sync::Arc;
use tempfile::TempDir;

fn updater(root: &Path, zip: &Path) -> SelfUpdater<FakeVersionSource, LocalFetcher> {
    SelfUpdater::new(
        FakeVersionSource::local("2.0.0", zip),
        UpdateSourceResolver::new(ResolverConfig::new(root, "app"), LocalFetcher),
        AtomicInstaller::new(root, "app"),
        UpdateLock::new(root),
        root.join("app"),
    )
}

/// A process that stays alive until killed.
fn other_process() -> Child {
    Command::new("sleep").arg("30").spawn().expect("sleep is available")
}

/// Leave a lock file behind as if `pid` held it.
fn lock_as(root: &Path, pid: u32) {
    match UpdateLock::with_pid(root, pid).try_acquire().unwrap() {
        LockAttempt::Acquired(guard) => std::mem::forget(guard),
        LockAttempt::Busy {
            ..
        } => panic!("lock unexpectedly busy"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_live_holder_blocks_then_dead_holder_is_reclaimed() -> Result<()> {
    let root = TempDir::new()?;
    let downloads = TempDir::new()?;
    install_tree(&root.path().join("app"), "old");
    std::fs::write(root.path().join(VERSION_FILE), "1.0.0\n")?;
    let zip = downloads.path().join("release.zip");
    release_zip(&zip, "app", "2.0.0", "new");

    let mut holder = other_process();
    let holder_pid = holder.id();
    lock_as(root.path(), holder_pid);

    let err = updater(root.path(), &zip)
        .update(None, &CancelFlag::new(), Arc::new(|_| {}))
        .await
        .unwrap_err();
    match err.downcast_ref::<UpdaterError>() {
        Some(UpdaterError::LockBusy {
            holder,
        }) => assert_eq!(*holder, Some(holder_pid)),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(root.path().join("app").join(ENTRY_SCRIPT))?,
        "#!/bin/bash\necho old\n"
    );

    // The holder dies without releasing; its lock is now stale
    holder.kill()?;
    holder.wait()?;

    let outcome = updater(root.path(), &zip)
        .update(None, &CancelFlag::new(), Arc::new(|_| {}))
        .await?;
    assert!(matches!(outcome, SelfUpdateOutcome::Updated { .. }), "{outcome:?}");
    assert!(!UpdateLock::new(root.path()).lock_file_path().exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_record_reports_holder() -> Result<()> {
    let root = TempDir::new()?;
    let mut holder = other_process();
    lock_as(root.path(), holder.id());

    let record = UpdateLock::new(root.path()).read_record()?.expect("lock file exists");
    assert_eq!(record.holder_pid, Some(holder.id()));
    assert!(record.created_at.is_some());

    match UpdateLock::new(root.path()).try_acquire()? {
        LockAttempt::Busy {
            holder: Some(pid),
        } => assert_eq!(pid, holder.id()),
        other => panic!("expected busy, got {other:?}"),
    }

    holder.kill()?;
    holder.wait()?;
    Ok(())
}
