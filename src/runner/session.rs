//! One invocation of the update script, as seen by the caller.
//!
//! A [`ProcessSession`] is handed out by
//! [`ProcessSupervisor::start`](super::ProcessSupervisor::start) once the
//! child is running. From then on three background tasks own the child:
//!
//! - two readers forward every stdout/stderr read verbatim as
//!   [`SessionEvent::Output`], followed by a [`SessionEvent::Progress`]
//!   whenever the same bytes contain a progress line
//! - a waiter reaps the child (or kills it on request), waits for both
//!   readers to drain, removes the credential shim, and emits the final
//!   [`SessionEvent::Finished`]
//!
//! Events travel through a bounded channel. When the subscriber stops
//! draining, the readers stop reading and the child blocks on its own pipe;
//! nothing accumulates inside the supervisor.
//!
//! Dropping a session that has not finished kills the child.

use crate::constants::{OUTPUT_CHUNK_SIZE, PROCESS_STOP_TIMEOUT};
use crate::core::UpdaterError;
use crate::runner::progress::{self, ProgressEvent};
use crate::runner::shim::CredentialShim;
use std::borrow::Cow;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Which standard stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Bytes exactly as one read from the child returned them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

impl OutputChunk {
    /// Lossy UTF-8 view for display. The raw bytes stay untouched.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// How a started child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with this status code.
    Exited(i32),
    /// Terminated by a signal nobody in this process sent.
    Crashed {
        signal: Option<i32>,
    },
    /// Terminated because [`ProcessSession::stop`] was called or the session was dropped.
    Killed,
}

impl ExitOutcome {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Status to pass through as this process's own exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Crashed {
                signal: Some(signal),
            } => 128 + *signal,
            Self::Crashed {
                signal: None,
            } => 1,
            Self::Killed => 137,
        }
    }

    pub(crate) fn from_status(status: ExitStatus, kill_requested: bool) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        if kill_requested {
            return Self::Killed;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self::Crashed {
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self::Crashed {
                signal: None,
            }
        }
    }
}

/// Lifecycle of a session. Transitions only move forward:
///
/// ```text
/// NotStarted -> Starting -> Running -> Finished
///                  |           |
///                  +-----------+--> FailedToStart
/// ```
///
/// `Running -> FailedToStart` is only taken when credential delivery fails.
#[derive(Debug, Clone)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Finished(ExitOutcome),
    FailedToStart(UpdaterError),
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_advance_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Starting)
                | (Self::Starting, Self::Running | Self::FailedToStart(_))
                | (Self::Running, Self::Finished(_))
                | (Self::Running, Self::FailedToStart(UpdaterError::CredentialWriteError { .. }))
        )
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::FailedToStart(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Finished(_) => "Finished",
            Self::FailedToStart(_) => "FailedToStart",
        }
    }
}

/// Shared, observable session state that rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<watch::Sender<SessionState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::NotStarted);
        Self(Arc::new(tx))
    }

    #[must_use]
    pub fn current(&self) -> SessionState {
        self.0.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.0.subscribe()
    }

    /// Move to `next` if the transition is legal. Returns whether it was applied.
    pub fn advance(&self, next: SessionState) -> bool {
        self.0.send_if_modified(|state| {
            if state.can_advance_to(&next) {
                trace!(target: "runner", "Session state {} -> {}", state.name(), next.name());
                *state = next;
                true
            } else {
                warn!(
                    target: "runner",
                    "Ignoring illegal session transition {} -> {}",
                    state.name(),
                    next.name()
                );
                false
            }
        })
    }
}

/// Everything a subscriber observes, in production order per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(OutputChunk),
    Progress(ProgressEvent),
    /// Always the last event of a session.
    Finished(ExitOutcome),
}

/// A running invocation of the update script.
#[derive(Debug)]
pub struct ProcessSession {
    pid: Option<u32>,
    command: Vec<String>,
    state: StateCell,
    events: mpsc::Receiver<SessionEvent>,
    kill: Option<oneshot::Sender<()>>,
    outcome: Option<ExitOutcome>,
}

impl ProcessSession {
    /// Take ownership of a running child and start the reader and waiter tasks.
    pub(crate) fn spawn(
        mut child: Child,
        command: Vec<String>,
        state: StateCell,
        shim: Option<CredentialShim>,
        capacity: usize,
    ) -> Self {
        let pid = child.id();
        let (tx, events) = mpsc::channel(capacity);
        let (kill_tx, kill_rx) = oneshot::channel();

        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|out| tokio::spawn(pump(out, OutputStream::Stdout, tx.clone()))),
            child.stderr.take().map(|err| tokio::spawn(pump(err, OutputStream::Stderr, tx.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();

        tokio::spawn(wait_for_exit(child, kill_rx, readers, shim, state.clone(), tx));

        Self {
            pid,
            command,
            state,
            events,
            kill: Some(kill_tx),
            outcome: None,
        }
    }

    /// OS process id of the child, if it was still running when observed.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The argv that was started. Never contains the credential.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Watch state changes without consuming events.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Next event, or `None` after [`SessionEvent::Finished`] has been returned.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.outcome.is_some() {
            return None;
        }
        match self.events.recv().await {
            Some(SessionEvent::Finished(outcome)) => {
                self.outcome = Some(outcome);
                self.kill = None;
                Some(SessionEvent::Finished(outcome))
            }
            Some(event) => Some(event),
            None => {
                // Waiter vanished without a final event; treat as killed
                let outcome = match self.state.current() {
                    SessionState::Finished(outcome) => outcome,
                    _ => ExitOutcome::Killed,
                };
                self.outcome = Some(outcome);
                None
            }
        }
    }

    /// Drain remaining events and return the outcome.
    pub async fn wait(mut self) -> ExitOutcome {
        while self.next_event().await.is_some() {}
        self.outcome.unwrap_or(ExitOutcome::Killed)
    }

    /// Kill the child and wait (bounded) for it to be reaped.
    ///
    /// Undelivered output is discarded. The kill is sent once and not retried.
    pub async fn stop(mut self) -> ExitOutcome {
        if let Some(kill) = self.kill.take() {
            debug!(target: "runner", "Stopping update script (pid {:?})", self.pid);
            let _ = kill.send(());
        }
        self.wait().await
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    let mut subscribed = true;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(target: "runner", "Failed to read {:?}: {}", stream, e);
                break;
            }
        };
        // Keep draining after the subscriber is gone so the child never
        // blocks on a full pipe
        if !subscribed {
            continue;
        }

        let chunk = OutputChunk {
            stream,
            bytes: buf[..n].to_vec(),
        };
        let progress = progress::parse(&chunk.text());

        if tx.send(SessionEvent::Output(chunk)).await.is_err() {
            subscribed = false;
            continue;
        }
        if let Some(event) = progress
            && tx.send(SessionEvent::Progress(event)).await.is_err()
        {
            subscribed = false;
        }
    }
    trace!(target: "runner", "{:?} reached end of stream", stream);
}

async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    shim: Option<CredentialShim>,
    state: StateCell,
    tx: mpsc::Sender<SessionEvent>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitOutcome::from_status(status, false),
            Err(e) => {
                warn!(target: "runner", "Failed to wait for update script: {}", e);
                ExitOutcome::Killed
            }
        },
        // Fires on stop() and when the session is dropped
        _ = kill_rx => kill_and_reap(&mut child, PROCESS_STOP_TIMEOUT).await,
    };

    // Readers finish once every holder of the pipes has exited; a detached
    // grandchild can keep them open, so the wait is bounded
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(PROCESS_STOP_TIMEOUT, reader).await.is_err() {
            warn!(target: "runner", "Output reader did not finish, abandoning it");
            abort.abort();
        }
    }

    if let Some(shim) = shim
        && let Err(e) = shim.remove()
    {
        warn!(target: "runner", "{:#}", e);
    }

    debug!(target: "runner", "Update script finished: {:?}", outcome);
    state.advance(SessionState::Finished(outcome));
    let _ = tx.send(SessionEvent::Finished(outcome)).await;
}

/// Send a kill and wait at most `grace` for the child to be reaped.
pub(crate) async fn kill_and_reap(child: &mut Child, grace: Duration) -> ExitOutcome {
    if let Err(e) = child.start_kill() {
        debug!(target: "runner", "Kill failed (child already gone?): {}", e);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => ExitOutcome::from_status(status, true),
        Ok(Err(e)) => {
            warn!(target: "runner", "Failed to reap killed child: {}", e);
            ExitOutcome::Killed
        }
        Err(_) => {
            warn!(
                target: "runner",
                "Child did not exit within {}s after kill, giving up the wait",
                grace.as_secs()
            );
            ExitOutcome::Killed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        let cell = StateCell::new();
        assert!(!cell.advance(SessionState::Running));
        assert!(cell.advance(SessionState::Starting));
        assert!(cell.advance(SessionState::Running));
        assert!(!cell.advance(SessionState::Starting));
        assert!(cell.advance(SessionState::Finished(ExitOutcome::Exited(0))));
        assert!(!cell.advance(SessionState::Finished(ExitOutcome::Exited(1))));
        assert!(matches!(cell.current(), SessionState::Finished(ExitOutcome::Exited(0))));
    }

    #[test]
    fn test_running_may_only_fail_on_credential_error() {
        let cell = StateCell::new();
        cell.advance(SessionState::Starting);
        cell.advance(SessionState::Running);
        assert!(!cell.advance(SessionState::FailedToStart(UpdaterError::FailedToStart {
            reason: "late".into(),
        })));
        assert!(cell.advance(SessionState::FailedToStart(UpdaterError::CredentialWriteError {
            expected: 9,
            written: 5,
        })));
        assert!(cell.current().is_terminal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitOutcome::Exited(3).exit_code(), 3);
        assert_eq!(
            ExitOutcome::Crashed {
                signal: Some(11)
            }
            .exit_code(),
            139
        );
        assert_eq!(ExitOutcome::Killed.exit_code(), 137);
        assert!(ExitOutcome::Exited(0).success());
    }

    #[tokio::test]
    async fn test_pump_forwards_bytes_verbatim() {
        let (tx, mut rx) = mpsc::channel(16);
        let input: &[u8] = b"line one\r\n  [##] 50% [1/2]\n\x1b[0mtail";
        pump(input, OutputStream::Stdout, tx).await;

        let mut collected = Vec::new();
        let mut progress = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Output(chunk) => collected.extend(chunk.bytes),
                SessionEvent::Progress(p) => progress.push(p),
                SessionEvent::Finished(_) => unreachable!(),
            }
        }
        assert_eq!(collected, input);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].percent, 50);
    }

    #[tokio::test]
    async fn test_pump_keeps_draining_without_subscriber() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = vec![b'x'; OUTPUT_CHUNK_SIZE * 4];
        // Must return instead of blocking on the closed channel
        pump(input.as_slice(), OutputStream::Stderr, tx).await;
    }
}
