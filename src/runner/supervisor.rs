//! Starting the update script.
//!
//! [`ProcessSupervisor::start`] turns a [`RunMode`] and an optional
//! [`Credential`] into a running [`ProcessSession`]. Before anything is
//! spawned, the supervisor probes the filesystem and `PATH`, so that a
//! missing script, interpreter or working directory is reported precisely
//! and nothing has to be undone.
//!
//! # Start diagnostics
//!
//! Spawning is where real systems fail in odd ways:
//!
//! - `EINTR`, `EAGAIN` and `ETXTBSY` do not mean the command is broken. The
//!   spawn is retried after a short pause until the start timeout elapses.
//! - A child that exits immediately with 126/127 was usually never able to
//!   run the script. The probes are repeated to name the cause; if they all
//!   pass, the exit is treated as the script's own result.
//! - Any other spawn error is re-probed, falling back to `FailedToStart`.

use crate::config::GlobalConfig;
use crate::constants::{
    PROCESS_START_TIMEOUT, PROCESS_STOP_TIMEOUT, SESSION_EVENT_CAPACITY, SPAWN_RETRY_DELAY,
    START_CONFIRMATION_WINDOW,
};
use crate::core::UpdaterError;
use crate::runner::credential::{self, Credential};
use crate::runner::session::{ProcessSession, SessionState, StateCell, kill_and_reap};
use crate::runner::shim::CredentialShim;
use anyhow::Result;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How the script is asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Only the check phase; nothing is changed.
    DryRun,
    /// The script asks before each component.
    Interactive,
    /// Full update.
    Real,
}

impl RunMode {
    /// Flag appended to the script's argv.
    #[must_use]
    pub const fn flag(self) -> Option<&'static str> {
        match self {
            Self::DryRun => Some("--dry-run"),
            Self::Interactive => Some("--interactive"),
            Self::Real => None,
        }
    }
}

/// Everything needed to start the script, fixed for the supervisor's lifetime.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub script_path: PathBuf,
    pub working_dir: PathBuf,
    /// Interpreter name or path, resolved through `PATH`.
    pub interpreter: String,
    /// Merged over the inherited environment.
    pub env_overrides: BTreeMap<String, String>,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    /// Where the credential shim is written; the system temp dir when `None`.
    pub shim_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    /// Run `script_path` with bash from the script's own directory.
    pub fn for_script(script_path: impl Into<PathBuf>) -> Self {
        let script_path = script_path.into();
        let working_dir =
            script_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        Self {
            script_path,
            working_dir,
            interpreter: "bash".to_string(),
            env_overrides: BTreeMap::new(),
            start_timeout: PROCESS_START_TIMEOUT,
            stop_timeout: PROCESS_STOP_TIMEOUT,
            shim_dir: None,
        }
    }

    /// Script location and `ENABLE_*` overrides from the user configuration.
    pub fn from_global(config: &GlobalConfig) -> Result<Self> {
        let mut supervisor = Self::for_script(config.script_path()?);
        supervisor.env_overrides = config.components.env_overrides();
        Ok(supervisor)
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }
}

/// Owns how the update script is launched.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

/// Stdin wiring for the child; `Stdio` itself cannot be reused across attempts.
#[derive(Debug, Clone, Copy)]
enum StdinKind {
    Null,
    Inherit,
    Piped,
}

impl StdinKind {
    fn stdio(self) -> Stdio {
        match self {
            Self::Null => Stdio::null(),
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
        }
    }
}

/// Result of one spawn attempt.
enum SpawnAttempt {
    Spawned(Child),
    /// The OS may have been mid-way through starting; try again.
    Ambiguous(io::Error),
    Failed(UpdaterError),
}

impl ProcessSupervisor {
    #[must_use]
    pub const fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Check everything that can be checked without spawning.
    ///
    /// Returns the resolved interpreter path.
    pub fn preflight(&self) -> Result<PathBuf, UpdaterError> {
        let cfg = &self.config;

        if !cfg.working_dir.is_dir() {
            return Err(UpdaterError::WorkingDirectoryMissing {
                path: cfg.working_dir.display().to_string(),
            });
        }
        if !cfg.script_path.is_file() {
            return Err(UpdaterError::ScriptNotFound {
                path: cfg.script_path.display().to_string(),
            });
        }
        if let Err(e) = std::fs::File::open(&cfg.script_path) {
            debug!(target: "runner", "Script not readable: {}", e);
            return Err(UpdaterError::ScriptNotExecutable {
                path: cfg.script_path.display().to_string(),
            });
        }
        which::which(&cfg.interpreter).map_err(|_| UpdaterError::InterpreterNotFound {
            interpreter: cfg.interpreter.clone(),
        })
    }

    /// Start the script.
    ///
    /// The credential is used only in [`RunMode::Real`]; in the other modes
    /// it is dropped unused. Without a credential, a real or interactive run
    /// inherits this process's stdin so `sudo` and the script can prompt.
    pub async fn start(
        &self,
        mode: RunMode,
        credential: Option<Credential>,
    ) -> Result<ProcessSession, UpdaterError> {
        let credential = match mode {
            RunMode::Real => credential,
            _ => None,
        };

        let state = StateCell::new();
        let interpreter = self.preflight()?;
        state.advance(SessionState::Starting);

        let shim = match &credential {
            Some(_) => {
                let created = match &self.config.shim_dir {
                    Some(dir) => CredentialShim::create_in(dir),
                    None => CredentialShim::create(),
                };
                match created {
                    Ok(shim) => Some(shim),
                    Err(e) => {
                        let err = UpdaterError::FailedToStart {
                            reason: format!("{e:#}"),
                        };
                        state.advance(SessionState::FailedToStart(err.clone()));
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let argv = self.argv(&interpreter, mode, shim.as_ref().map(CredentialShim::path));
        let stdin = if credential.is_some() {
            StdinKind::Piped
        } else if mode == RunMode::DryRun {
            StdinKind::Null
        } else {
            StdinKind::Inherit
        };

        let mut child = match self.spawn_with_retry(&argv, stdin).await {
            Ok(child) => child,
            Err(err) => {
                state.advance(SessionState::FailedToStart(err.clone()));
                return Err(err);
            }
        };

        if let Some(err) = self.confirm_started(&mut child).await {
            state.advance(SessionState::FailedToStart(err.clone()));
            return Err(err);
        }

        info!(target: "runner", "Started update script (pid {:?}, mode {:?})", child.id(), mode);
        state.advance(SessionState::Running);

        if let Some(credential) = credential {
            let Some(mut stdin) = child.stdin.take() else {
                let err = UpdaterError::FailedToStart {
                    reason: "stdin of the child was not captured".to_string(),
                };
                kill_and_reap(&mut child, self.config.stop_timeout).await;
                state.advance(SessionState::FailedToStart(err.clone()));
                return Err(err);
            };
            deliver_or_kill(&mut child, &mut stdin, credential, &state, self.config.stop_timeout)
                .await?;
        }

        Ok(ProcessSession::spawn(child, argv, state, shim, SESSION_EVENT_CAPACITY))
    }

    fn argv(&self, interpreter: &Path, mode: RunMode, shim: Option<&Path>) -> Vec<String> {
        let mut argv = vec![interpreter.display().to_string()];
        if let Some(shim) = shim {
            argv.push(shim.display().to_string());
        }
        argv.push(self.config.script_path.display().to_string());
        if let Some(flag) = mode.flag() {
            argv.push(flag.to_string());
        }
        argv
    }

    async fn spawn_with_retry(&self, argv: &[String], stdin: StdinKind) -> Result<Child, UpdaterError> {
        let deadline = Instant::now() + self.config.start_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.spawn_once(argv, stdin) {
                SpawnAttempt::Spawned(child) => return Ok(child),
                SpawnAttempt::Failed(err) => return Err(err),
                SpawnAttempt::Ambiguous(e) => {
                    if Instant::now() + SPAWN_RETRY_DELAY >= deadline {
                        warn!(target: "runner", "Giving up after {} spawn attempts: {}", attempt, e);
                        return Err(UpdaterError::Timedout {
                            operation: "starting the update script".to_string(),
                            seconds: self.config.start_timeout.as_secs(),
                        });
                    }
                    debug!(target: "runner", "Ambiguous spawn error ({}), retrying", e);
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
            }
        }
    }

    fn spawn_once(&self, argv: &[String], stdin: StdinKind) -> SpawnAttempt {
        let Some((program, args)) = argv.split_first() else {
            return SpawnAttempt::Failed(UpdaterError::FailedToStart {
                reason: "empty command".to_string(),
            });
        };

        debug!(target: "runner", "Executing: {}", argv.join(" "));
        for (key, value) in &self.config.env_overrides {
            debug!(target: "runner", "  env {}={}", key, value);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.config.working_dir)
            .envs(&self.config.env_overrides)
            .stdin(stdin.stdio())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(child) => SpawnAttempt::Spawned(child),
            Err(e) if is_ambiguous(&e) => SpawnAttempt::Ambiguous(e),
            Err(e) => SpawnAttempt::Failed(self.diagnose(&e.to_string())),
        }
    }

    /// Name the most specific cause for a failed start.
    fn diagnose(&self, reason: &str) -> UpdaterError {
        match self.preflight() {
            Err(specific) => specific,
            Ok(_) => UpdaterError::FailedToStart {
                reason: reason.to_string(),
            },
        }
    }

    /// Catch children that died before they could run the script.
    async fn confirm_started(&self, child: &mut Child) -> Option<UpdaterError> {
        tokio::time::sleep(START_CONFIRMATION_WINDOW).await;
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                debug!(target: "runner", "try_wait failed during start confirmation: {}", e);
                return None;
            }
        };

        let code = status.code()?;
        if code != 126 && code != 127 {
            return None;
        }

        match self.preflight() {
            Err(specific) => Some(specific),
            // Probes pass: this is the script's own exit status
            Ok(_) => {
                debug!(target: "runner", "Script exited {} immediately", code);
                None
            }
        }
    }
}

/// Hand the credential to the child, or kill it if the handoff is incomplete.
pub(crate) async fn deliver_or_kill<W>(
    child: &mut Child,
    writer: &mut W,
    credential: Credential,
    state: &StateCell,
    grace: Duration,
) -> Result<(), UpdaterError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match credential::deliver(credential, writer).await {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(target: "runner", "{}; killing the update script", err);
            kill_and_reap(child, grace).await;
            let err = match err {
                e @ UpdaterError::CredentialWriteError {
                    ..
                } => e,
                // A failed write transferred nothing
                other => {
                    debug!(target: "runner", "Credential write failed: {}", other);
                    UpdaterError::CredentialWriteError {
                        expected: 0,
                        written: 0,
                    }
                }
            };
            state.advance(SessionState::FailedToStart(err.clone()));
            Err(err)
        }
    }
}

fn is_ambiguous(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(e.raw_os_error(), Some(libc::EINTR | libc::EAGAIN | libc::ETXTBSY))
    }
    #[cfg(not(unix))]
    {
        false
    }
}
