//! Smoke tests of the compiled binary.

use assert_cmd::Command;
use multi_updater::test_utils::write_script;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// A config file pointing at `script_dir`, with every source disabled.
fn config_for(dir: &Path, script_dir: &Path) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        format!(
            "script_dir = {:?}\n\n[components]\nsystem = false\naur = false\ncursor = false\nadguard = false\nflatpak = false\n",
            script_dir.display().to_string()
        ),
    )
    .unwrap();
    path
}

fn cmd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("multi-updater").unwrap();
    cmd.arg("--config").arg(config).arg("--no-progress").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("multi-updater")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("self-update"))
        .stdout(predicate::str::contains("sources"));
}

#[cfg(unix)]
#[test]
fn test_check_streams_dry_run_and_passes_exit_code() {
    let dir = TempDir::new().unwrap();
    let script_dir = dir.path().join("app");
    std::fs::create_dir(&script_dir).unwrap();
    write_script(
        &script_dir,
        "update-all.sh",
        "#!/bin/bash\necho \"dry:$1 flatpak:$ENABLE_FLATPAK_UPDATE\"\nexit 4\n",
    );
    let config = config_for(dir.path(), &script_dir);

    cmd(&config)
        .arg("check")
        .assert()
        .code(4)
        .stdout(predicate::str::contains("dry:--dry-run flatpak:false"));
}

#[cfg(unix)]
#[test]
fn test_run_reports_missing_script() {
    let dir = TempDir::new().unwrap();
    let script_dir = dir.path().join("app");
    std::fs::create_dir(&script_dir).unwrap();
    let config = config_for(dir.path(), &script_dir);

    cmd(&config)
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Update script not found"));
}

#[cfg(unix)]
#[test]
fn test_run_with_empty_password_stdin_fails_before_starting() {
    let dir = TempDir::new().unwrap();
    let script_dir = dir.path().join("app");
    std::fs::create_dir(&script_dir).unwrap();
    let marker = dir.path().join("ran");
    write_script(
        &script_dir,
        "update-all.sh",
        &format!("#!/bin/bash\ntouch {}\n", marker.display()),
    );
    let config = config_for(dir.path(), &script_dir);

    cmd(&config)
        .args(["run", "--password-stdin"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("password"));
    assert!(!marker.exists());
}

#[test]
fn test_sources_with_everything_disabled() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), dir.path());

    cmd(&config)
        .arg("sources")
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled"));
}

#[test]
fn test_config_path_and_init() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("sub").join("config.toml");

    cmd(&config)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));

    cmd(&config).args(["config", "init"]).assert().success();
    assert!(config.exists());
    let written = std::fs::read_to_string(&config).unwrap();
    assert!(written.contains("[components]"));
}

#[test]
fn test_invalid_config_is_a_friendly_error() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "this is = = not toml").unwrap();

    cmd(&config)
        .arg("sources")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_backups_list_when_none() {
    let dir = TempDir::new().unwrap();
    let script_dir = dir.path().join("app");
    std::fs::create_dir(&script_dir).unwrap();
    let config = config_for(dir.path(), &script_dir);

    cmd(&config)
        .args(["backups", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups of app"));
}
