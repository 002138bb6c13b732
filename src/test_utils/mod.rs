//! Test utilities for multi-updater
//!
//! Fixtures for installation trees, archive builders, directory snapshots for
//! byte-identity checks, and in-process fakes for the network-facing traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use multi_updater::test_utils::{install_tree, snapshot};
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! let live = dir.path().join("app");
//! install_tree(&live, "old");
//! let before = snapshot(&live);
//! // ... run something that must not change `live` ...
//! assert_eq!(snapshot(&live), before);
//! ```

pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeVersionSource, LocalFetcher};
pub use fixtures::{
    ZipBuilder, install_tree, release_zip, snapshot, staging_from_tree, write_script,
};

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Only the first call has an effect. Uses `level` when given, otherwise
/// `RUST_LOG`; with neither, tests run without a subscriber.
///
/// ```bash
/// RUST_LOG=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}
