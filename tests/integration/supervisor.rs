//! The supervisor against real bash scripts.

use anyhow::Result;
use multi_updater::core::UpdaterError;
use multi_updater::runner::{
    Credential, ExitOutcome, OutputStream, ProcessSupervisor, ProgressEvent, RunMode,
    SessionEvent, SessionState, SupervisorConfig,
};
use multi_updater::test_utils::write_script;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Collected {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    progress: Vec<ProgressEvent>,
    outcome: Option<ExitOutcome>,
    events_after_finish: usize,
}

async fn run(script_body: &str, mode: RunMode, config: impl FnOnce(SupervisorConfig) -> SupervisorConfig) -> Result<Collected> {
    let dir = TempDir::new()?;
    let path = write_script(dir.path(), "update-all.sh", &format!("#!/bin/bash\n{script_body}"));
    let supervisor = ProcessSupervisor::new(config(SupervisorConfig::for_script(path)));
    let mut session = supervisor.start(mode, None).await?;

    let mut collected = Collected {
        stdout: Vec::new(),
        stderr: Vec::new(),
        progress: Vec::new(),
        outcome: None,
        events_after_finish: 0,
    };
    while let Some(event) = session.next_event().await {
        if collected.outcome.is_some() {
            collected.events_after_finish += 1;
        }
        match event {
            SessionEvent::Output(chunk) => match chunk.stream {
                OutputStream::Stdout => collected.stdout.extend(chunk.bytes),
                OutputStream::Stderr => collected.stderr.extend(chunk.bytes),
            },
            SessionEvent::Progress(p) => collected.progress.push(p),
            SessionEvent::Finished(outcome) => collected.outcome = Some(outcome),
        }
    }
    assert!(matches!(session.state(), SessionState::Finished(_)));
    Ok(collected)
}

#[cfg(unix)]
#[tokio::test]
async fn test_output_is_byte_exact_and_exit_code_passes_through() -> Result<()> {
    // Invalid UTF-8, carriage returns, and more than one read buffer of data
    let body = r#"printf 'caf\xc3\xa9 \xff\xfe\r\n'
head -c 20000 /dev/zero | tr '\0' 'x'
printf '\nerr line\n' >&2
exit 7
"#;
    let collected = run(body, RunMode::Real, |c| c).await?;

    let mut expected = b"caf\xc3\xa9 \xff\xfe\r\n".to_vec();
    expected.extend(std::iter::repeat_n(b'x', 20_000));
    expected.push(b'\n');
    assert_eq!(collected.stdout, expected);
    assert_eq!(collected.stderr, b"\nerr line\n");
    assert_eq!(collected.outcome, Some(ExitOutcome::Exited(7)));
    assert_eq!(collected.events_after_finish, 0);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_progress_events_follow_output_order() -> Result<()> {
    let body = r#"for step in 1 2 3 4; do
  echo "[update] $((step * 25))% [$step/4]"
  sleep 0.05
done
"#;
    let collected = run(body, RunMode::DryRun, |c| c).await?;

    let percents: Vec<u8> = collected.progress.iter().map(|p| p.percent).collect();
    assert_eq!(percents, vec![25, 50, 75, 100]);
    assert_eq!(collected.progress.last().and_then(|p| p.step), Some((4, 4)));
    assert!(collected.outcome.is_some_and(|o| o.success()));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_mode_flags_and_component_env_reach_script() -> Result<()> {
    let body = r#"echo "args=[$*] aur=${ENABLE_AUR_UPDATE:-unset} pwd=$(basename "$PWD")""#;
    let dry = run(body, RunMode::DryRun, |c| c.env("ENABLE_AUR_UPDATE", "false")).await?;
    let dry = String::from_utf8(dry.stdout)?;
    assert!(dry.starts_with("args=[--dry-run] aur=false"), "{dry}");

    let interactive = run(body, RunMode::Interactive, |c| c).await?;
    let interactive = String::from_utf8(interactive.stdout)?;
    assert!(interactive.starts_with("args=[--interactive] aur=unset"), "{interactive}");
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_signal_death_is_a_crash() -> Result<()> {
    let collected = run("echo dying\nkill -TERM $$\n", RunMode::DryRun, |c| c).await?;
    assert_eq!(
        collected.outcome,
        Some(ExitOutcome::Crashed {
            signal: Some(15),
        })
    );
    assert_eq!(collected.outcome.map(|o| o.exit_code()), Some(143));
    Ok(())
}

#[tokio::test]
async fn test_missing_script_fails_before_spawning() {
    let dir = TempDir::new().unwrap();
    let config = SupervisorConfig::for_script(dir.path().join("update-all.sh"));
    let err = ProcessSupervisor::new(config).start(RunMode::DryRun, None).await.unwrap_err();
    assert!(matches!(err, UpdaterError::ScriptNotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_missing_interpreter_is_named() {
    let dir = TempDir::new().unwrap();
    let path: PathBuf = write_script(dir.path(), "update-all.sh", "#!/bin/bash\necho hi\n");
    let mut config = SupervisorConfig::for_script(path);
    config.interpreter = "no-such-shell-xyz".to_string();

    let err = ProcessSupervisor::new(config).start(RunMode::Real, None).await.unwrap_err();
    match err {
        UpdaterError::InterpreterNotFound {
            interpreter,
        } => assert_eq!(interpreter, "no-such-shell-xyz"),
        other => panic!("unexpected error: {other:?}"),
    }
}

/// A `sudo` that records the line it was given and accepts only `hunter2`.
fn stub_sudo(dir: &Path) -> PathBuf {
    let received = dir.join("received");
    write_script(
        dir,
        "sudo",
        &format!(
            r#"IFS= read -r line
printf '%s' "$line" > '{received}'
[ "$line" = hunter2 ]"#,
            received = received.display(),
        ),
    );
    received
}

/// A real run with a credential, `sudo` resolved from `bin` first.
async fn run_with_credential(
    bin: &Path,
    shim_dir: &Path,
    secret: &str,
) -> Result<(Vec<String>, Vec<u8>, Vec<u8>, Option<ExitOutcome>)> {
    let dir = TempDir::new()?;
    let path = write_script(dir.path(), "update-all.sh", "echo \"script ran: $*\"\nenv\n");
    let mut config = SupervisorConfig::for_script(path).env(
        "PATH",
        format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default()),
    );
    config.shim_dir = Some(shim_dir.to_path_buf());

    let mut session = ProcessSupervisor::new(config).start(RunMode::Real, Some(Credential::new(secret))).await?;
    let command = session.command().to_vec();

    let (mut stdout, mut stderr, mut outcome) = (Vec::new(), Vec::new(), None);
    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::Output(chunk) => match chunk.stream {
                OutputStream::Stdout => stdout.extend(chunk.bytes),
                OutputStream::Stderr => stderr.extend(chunk.bytes),
            },
            SessionEvent::Progress(_) => {}
            SessionEvent::Finished(o) => outcome = Some(o),
        }
    }
    Ok((command, stdout, stderr, outcome))
}

#[cfg(unix)]
#[tokio::test]
async fn test_credential_reaches_sudo_only_through_stdin() -> Result<()> {
    let bin = TempDir::new()?;
    let shim_dir = TempDir::new()?;
    let received = stub_sudo(bin.path());

    let (command, stdout, _, outcome) =
        run_with_credential(bin.path(), shim_dir.path(), "hunter2").await?;

    assert_eq!(std::fs::read_to_string(&received)?, "hunter2");
    assert_eq!(outcome, Some(ExitOutcome::Exited(0)));
    let stdout = String::from_utf8(stdout)?;
    assert!(stdout.starts_with("script ran: \n"), "{stdout}");
    assert!(!stdout.contains("hunter2"), "credential leaked into the environment");

    assert_eq!(command.len(), 3);
    assert!(Path::new(&command[1]).starts_with(shim_dir.path()));
    assert!(command.iter().all(|arg| !arg.contains("hunter2")));

    assert_eq!(std::fs::read_dir(shim_dir.path())?.count(), 0);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_rejected_credential_never_runs_script() -> Result<()> {
    let bin = TempDir::new()?;
    let shim_dir = TempDir::new()?;
    let received = stub_sudo(bin.path());

    let (_, stdout, stderr, outcome) = run_with_credential(bin.path(), shim_dir.path(), "wrong").await?;

    assert_eq!(std::fs::read_to_string(&received)?, "wrong");
    assert_eq!(outcome, Some(ExitOutcome::Exited(1)));
    assert!(stdout.is_empty());
    assert!(String::from_utf8(stderr)?.contains("sudo authentication failed"));
    assert_eq!(std::fs::read_dir(shim_dir.path())?.count(), 0);
    Ok(())
}
