//! Error handling for the updater
//!
//! Two layers, the same way the rest of the crate is built:
//! 1. [`UpdaterError`], a strongly-typed enum carrying every result code the
//!    supervisor and the self-update engine can surface.
//! 2. [`ErrorContext`], a wrapper that adds details and an actionable
//!    suggestion for CLI users.
//!
//! Internals return [`anyhow::Result`] and attach an [`UpdaterError`] wherever
//! the caller needs to branch on the outcome. At the CLI boundary
//! [`user_friendly_error`] downcasts the chain back into an [`ErrorContext`].
//!
//! # Error Categories
//!
//! Every variant maps onto one [`ErrorCategory`]:
//! - **Pre-flight**: detected before any side effect ([`UpdaterError::ScriptNotFound`],
//!   [`UpdaterError::InterpreterNotFound`], ...). Nothing to undo.
//! - **Transient**: network trouble, retried up to a budget before surfacing.
//! - **Mid-operation**: copy/rename/write failures. Always surfaced after rollback.
//! - **Verification**: the swap worked but the new tree is incomplete.
//! - **Concurrency**: another update holds the lock. Never retried automatically.
//!
//! # Examples
//!
//! ```rust,no_run
//! use multi_updater::core::{UpdaterError, user_friendly_error};
//!
//! let err = anyhow::Error::from(UpdaterError::LockBusy { holder: Some(4242) });
//! let ctx = user_friendly_error(err);
//! assert_eq!(ctx.exit_code(), 2);
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// Coarse classification of an [`UpdaterError`], used to decide how the
/// caller reports it and whether anything had to be undone first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected before any side effect.
    PreFlight,
    /// Network hiccup; already retried when it reaches the caller.
    Transient,
    /// A mutating step failed; rollback or cleanup has run.
    MidOperation,
    /// The installed tree failed its integrity check.
    Verification,
    /// The update lock is held by a live process.
    Concurrency,
    /// The user asked to stop.
    Cancelled,
    /// The supervised child ended abnormally.
    Process,
}

/// The error type for every failure the updater reports.
///
/// Variants carry owned strings rather than paths so the enum stays cheap to
/// clone into an [`ErrorContext`].
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// The update script does not exist at the configured path
    #[error("Update script not found: {path}")]
    ScriptNotFound {
        /// Path that was probed
        path: String,
    },

    /// The interpreter used to run the script is not on `PATH`
    #[error("Interpreter '{interpreter}' not found in PATH")]
    InterpreterNotFound {
        /// Interpreter name, e.g. `bash`
        interpreter: String,
    },

    /// The script exists but cannot be read or executed
    #[error("Update script is not readable: {path}")]
    ScriptNotExecutable {
        /// Path of the script
        path: String,
    },

    /// The configured working directory is missing
    #[error("Working directory does not exist: {path}")]
    WorkingDirectoryMissing {
        /// Directory that was probed
        path: String,
    },

    /// The child could not be started and no more specific cause was found
    #[error("Failed to start update script: {reason}")]
    FailedToStart {
        /// OS error or probe result
        reason: String,
    },

    /// Fewer credential bytes reached the child than were sent
    #[error("Credential delivery incomplete: wrote {written} of {expected} bytes")]
    CredentialWriteError {
        /// Bytes that should have been written
        expected: usize,
        /// Bytes the write actually transferred
        written: usize,
    },

    /// The child was terminated by a signal it did not ask for
    #[error("Update script crashed{}", .signal.map(|s| format!(" (signal {s})")).unwrap_or_default())]
    Crashed {
        /// Terminating signal, when the platform reports one
        signal: Option<i32>,
    },

    /// A bounded wait ran out
    #[error("Timed out after {seconds}s while {operation}")]
    Timedout {
        /// What was being waited on
        operation: String,
        /// The bound that expired
        seconds: u64,
    },

    /// Another process holds the update lock
    #[error("Another update is already running{}", .holder.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    LockBusy {
        /// PID recorded in the lock file, if it could be read
        holder: Option<u32>,
    },

    /// Critical files are missing from the freshly swapped installation
    #[error("Installation verification failed, missing: {}", .missing.join(", "))]
    VerificationFailed {
        /// Relative paths that were expected but absent
        missing: Vec<String>,
    },

    /// An install failed and the previous state was recovered
    #[error("Update failed, {recovery}: {reason}")]
    RolledBack {
        /// Why the install failed
        reason: String,
        /// Human description of the recovery that ran
        recovery: String,
    },

    /// The operation was cancelled before it modified the installation
    #[error("Operation cancelled")]
    Cancelled,

    /// The reachability probe failed before a download
    #[error("Network unreachable: could not connect to {host}:{port}")]
    NetworkUnreachable {
        /// Probe host
        host: String,
        /// Probe port
        port: u16,
    },

    /// Every download attempt failed
    #[error("Download failed after {attempts} attempt(s): {reason}")]
    DownloadFailed {
        /// URL that was requested
        url: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// The downloaded archive does not match its published digest or size
    #[error("Downloaded archive failed verification: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Published value
        expected: String,
        /// Computed value
        actual: String,
    },

    /// The extracted archive has no directory containing the entry script
    #[error("No project folder containing {script} found in the downloaded archive")]
    ProjectFolderNotFound {
        /// Entry script that was searched for
        script: String,
    },

    /// A git command returned a non-zero status
    #[error("Git operation failed: {operation}")]
    GitCommandError {
        /// The git subcommand, e.g. `pull`
        operation: String,
        /// Captured stderr
        stderr: String,
    },

    /// Git is not installed
    #[error("Git is not installed or not found in PATH")]
    GitNotFound,

    /// The configuration file could not be parsed
    #[error("Invalid configuration in {file}: {reason}")]
    ConfigError {
        /// Path of the configuration file
        file: String,
        /// Parser message
        reason: String,
    },

    /// Underlying IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else, with its message preserved
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl Clone for UpdaterError {
    fn clone(&self) -> Self {
        match self {
            Self::ScriptNotFound {
                path,
            } => Self::ScriptNotFound {
                path: path.clone(),
            },
            Self::InterpreterNotFound {
                interpreter,
            } => Self::InterpreterNotFound {
                interpreter: interpreter.clone(),
            },
            Self::ScriptNotExecutable {
                path,
            } => Self::ScriptNotExecutable {
                path: path.clone(),
            },
            Self::WorkingDirectoryMissing {
                path,
            } => Self::WorkingDirectoryMissing {
                path: path.clone(),
            },
            Self::FailedToStart {
                reason,
            } => Self::FailedToStart {
                reason: reason.clone(),
            },
            Self::CredentialWriteError {
                expected,
                written,
            } => Self::CredentialWriteError {
                expected: *expected,
                written: *written,
            },
            Self::Crashed {
                signal,
            } => Self::Crashed {
                signal: *signal,
            },
            Self::Timedout {
                operation,
                seconds,
            } => Self::Timedout {
                operation: operation.clone(),
                seconds: *seconds,
            },
            Self::LockBusy {
                holder,
            } => Self::LockBusy {
                holder: *holder,
            },
            Self::VerificationFailed {
                missing,
            } => Self::VerificationFailed {
                missing: missing.clone(),
            },
            Self::RolledBack {
                reason,
                recovery,
            } => Self::RolledBack {
                reason: reason.clone(),
                recovery: recovery.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::NetworkUnreachable {
                host,
                port,
            } => Self::NetworkUnreachable {
                host: host.clone(),
                port: *port,
            },
            Self::DownloadFailed {
                url,
                attempts,
                reason,
            } => Self::DownloadFailed {
                url: url.clone(),
                attempts: *attempts,
                reason: reason.clone(),
            },
            Self::ChecksumMismatch {
                expected,
                actual,
            } => Self::ChecksumMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::ProjectFolderNotFound {
                script,
            } => Self::ProjectFolderNotFound {
                script: script.clone(),
            },
            Self::GitCommandError {
                operation,
                stderr,
            } => Self::GitCommandError {
                operation: operation.clone(),
                stderr: stderr.clone(),
            },
            Self::GitNotFound => Self::GitNotFound,
            Self::ConfigError {
                file,
                reason,
            } => Self::ConfigError {
                file: file.clone(),
                reason: reason.clone(),
            },
            // io::Error is not Clone; keep the kind and the message
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Other {
                message,
            } => Self::Other {
                message: message.clone(),
            },
        }
    }
}

impl UpdaterError {
    /// Map this error onto the reporting taxonomy.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ScriptNotFound {
                ..
            }
            | Self::InterpreterNotFound {
                ..
            }
            | Self::ScriptNotExecutable {
                ..
            }
            | Self::WorkingDirectoryMissing {
                ..
            }
            | Self::GitNotFound
            | Self::ConfigError {
                ..
            } => ErrorCategory::PreFlight,
            Self::NetworkUnreachable {
                ..
            }
            | Self::DownloadFailed {
                ..
            }
            | Self::GitCommandError {
                ..
            } => ErrorCategory::Transient,
            Self::VerificationFailed {
                ..
            }
            | Self::ChecksumMismatch {
                ..
            } => ErrorCategory::Verification,
            Self::LockBusy {
                ..
            } => ErrorCategory::Concurrency,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::FailedToStart {
                ..
            }
            | Self::CredentialWriteError {
                ..
            }
            | Self::Crashed {
                ..
            }
            | Self::Timedout {
                ..
            } => ErrorCategory::Process,
            Self::RolledBack {
                ..
            }
            | Self::ProjectFolderNotFound {
                ..
            }
            | Self::Io(_)
            | Self::Other {
                ..
            } => ErrorCategory::MidOperation,
        }
    }

    /// Shorthand for [`UpdaterError::Other`].
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Error wrapper with user-facing details and a suggestion.
///
/// The CLI prints this instead of the raw error. Build one with
/// [`user_friendly_error`] rather than by hand.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: UpdaterError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a context with no details or suggestion.
    #[must_use]
    pub const fn new(error: UpdaterError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error. Printed in green.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add details explaining the error. Printed in yellow.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error, details and suggestion to stderr with terminal colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }

    /// Process exit status for this error.
    ///
    /// - `2`: another update is running
    /// - `3`: the update failed and was rolled back
    /// - `130`: cancelled by the user
    /// - `1`: everything else
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.error {
            UpdaterError::LockBusy {
                ..
            } => 2,
            UpdaterError::RolledBack {
                ..
            } => 3,
            UpdaterError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

/// Convert any error into an [`ErrorContext`] with suggestions.
///
/// The whole `anyhow` chain is searched for an [`UpdaterError`], so a typed
/// error wrapped in `.context(...)` calls is still recognised. IO, TOML and
/// HTTP errors get generic advice; anything else is reported with its chain.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(updater_error) = error.chain().find_map(|e| e.downcast_ref::<UpdaterError>()) {
        let ctx = create_error_context(updater_error.clone());
        // Keep the outer context message when the typed error was wrapped
        if ctx.details.is_none() && error.downcast_ref::<UpdaterError>().is_none() {
            return ctx.with_details(error.to_string());
        }
        return ctx;
    }

    if let Some(toml_error) = error.chain().find_map(|e| e.downcast_ref::<toml::de::Error>()) {
        return ErrorContext::new(UpdaterError::ConfigError {
            file: "config.toml".to_string(),
            reason: toml_error.to_string(),
        })
        .with_suggestion("Check the TOML syntax, or run 'multi-updater config init --force' to start over")
        .with_details(error.to_string());
    }

    if let Some(http_error) = error.chain().find_map(|e| e.downcast_ref::<reqwest::Error>()) {
        return ErrorContext::new(UpdaterError::other(error.to_string()))
            .with_suggestion("Check your internet connection and try again")
            .with_details(if http_error.is_timeout() {
                "The request to the release server timed out".to_string()
            } else {
                http_error.to_string()
            });
    }

    if let Some(io_error) = error.chain().find_map(|e| e.downcast_ref::<std::io::Error>()) {
        match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                return ErrorContext::new(UpdaterError::other(error.to_string()))
                    .with_suggestion("Check ownership of the installation directory")
                    .with_details("The updater was denied access to a file it needs to read or write");
            }
            std::io::ErrorKind::NotFound => {
                return ErrorContext::new(UpdaterError::other(error.to_string()))
                    .with_suggestion("Check that the file or directory exists and the path is correct");
            }
            _ => {}
        }
    }

    let mut message = error.to_string();
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }
    ErrorContext::new(UpdaterError::other(message))
}

fn create_error_context(error: UpdaterError) -> ErrorContext {
    match &error {
        UpdaterError::ScriptNotFound {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Set 'script_dir' in the configuration to the directory containing update-all.sh")
            .with_details("Nothing was started"),
        UpdaterError::InterpreterNotFound {
            interpreter,
        } => {
            let suggestion = format!("Install {interpreter} with 'sudo pacman -S {interpreter}'");
            ErrorContext::new(error).with_suggestion(suggestion)
        }
        UpdaterError::ScriptNotExecutable {
            path,
        } => {
            let suggestion = format!("Fix the permissions with 'chmod u+rx {path}'");
            ErrorContext::new(error).with_suggestion(suggestion)
        }
        UpdaterError::WorkingDirectoryMissing {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Reinstall the updater or correct 'script_dir' in the configuration"),
        UpdaterError::CredentialWriteError {
            ..
        } => ErrorContext::new(error)
            .with_details("The update script was stopped before it could wait forever for input")
            .with_suggestion("Try again; if it keeps failing, run the script once with 'sudo -v' first"),
        UpdaterError::LockBusy {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Wait for the other update to finish. If none is running, remove the .update.lock file")
            .with_details("Nothing was changed"),
        UpdaterError::VerificationFailed {
            ..
        } => ErrorContext::new(error)
            .with_details("The downloaded release is incomplete; the previous installation was restored"),
        UpdaterError::RolledBack {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Run 'multi-updater self-update' again later, or update manually with git"),
        UpdaterError::Cancelled => {
            ErrorContext::new(error).with_details("The installation was left unchanged")
        }
        UpdaterError::NetworkUnreachable {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Check your internet connection, or disable the check with [network] enabled = false")
            .with_details("No download was attempted"),
        UpdaterError::DownloadFailed {
            ..
        }
        | UpdaterError::ChecksumMismatch {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Try again later; GitHub may be rate limiting requests")
            .with_details("No changes were made to the installation"),
        UpdaterError::GitNotFound => ErrorContext::new(error)
            .with_suggestion("Install git with 'sudo pacman -S git'"),
        UpdaterError::GitCommandError {
            operation,
            stderr,
        } => {
            let suggestion = if stderr.contains("Not possible to fast-forward")
                || stderr.contains("diverging")
            {
                "Local changes prevent a fast-forward. Commit or stash them, then retry"
            } else if operation == "pull" {
                "Check your internet connection and try 'git pull' manually in the installation directory"
            } else {
                "Check the repository state with 'git status'"
            };
            let details = stderr.trim().to_string();
            let ctx = ErrorContext::new(error).with_suggestion(suggestion);
            if details.is_empty() { ctx } else { ctx.with_details(details) }
        }
        UpdaterError::ConfigError {
            ..
        } => ErrorContext::new(error).with_suggestion("Fix or regenerate the file with 'multi-updater config init --force'"),
        _ => ErrorContext::new(error),
    }
}
