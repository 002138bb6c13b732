//! Logging setup.
//!
//! The subscriber is built exactly once, by `main`, from a [`LogConfig`]
//! derived from the command line. Library code only emits `tracing` events
//! and never installs a subscriber of its own; tests use
//! `test_utils::init_test_logging` instead.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// How the process should log.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directive, e.g. `"debug"` or `"multi_updater::runner=trace"`.
    /// `None` disables console logging unless `RUST_LOG` is set.
    pub level: Option<String>,

    /// Append a copy of every event to this file (no ANSI colors).
    pub log_file: Option<PathBuf>,
}

impl LogConfig {
    /// Level implied by the `--verbose` / `--quiet` flags.
    #[must_use]
    pub fn from_flags(verbose: bool, quiet: bool, log_file: Option<PathBuf>) -> Self {
        let level = if verbose {
            Some("debug".to_string())
        } else if quiet {
            Some("error".to_string())
        } else {
            Some("warn".to_string())
        };
        Self {
            level,
            log_file,
        }
    }

    fn filter(&self) -> Option<EnvFilter> {
        if std::env::var("RUST_LOG").is_ok() {
            return Some(EnvFilter::from_default_env());
        }
        self.level.as_deref().map(EnvFilter::new)
    }
}

/// Install the global subscriber. Call once at startup.
///
/// Console output goes to stderr so the script's own output on stdout stays
/// clean for piping.
pub fn init(config: &LogConfig) -> Result<()> {
    let Some(filter) = config.filter() else {
        return Ok(());
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false).with_target(true))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .context("Logging was already initialised")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_from_flags() {
        assert_eq!(LogConfig::from_flags(true, false, None).level.as_deref(), Some("debug"));
        assert_eq!(LogConfig::from_flags(false, true, None).level.as_deref(), Some("error"));
        assert_eq!(LogConfig::from_flags(false, false, None).level.as_deref(), Some("warn"));
    }
}
