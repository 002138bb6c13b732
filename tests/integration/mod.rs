//! Integration test suite for multi-updater
//!
//! End-to-end tests on temporary directories: the self-update pipeline with a
//! fake release source and real zip archives, the update lock across
//! processes, the supervisor against real bash scripts, the package-source
//! probes, and smoke tests of the compiled binary.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **self_update**: update, rollback and cancellation of an installation
//! - **lock**: lock contention between live and dead processes
//! - **supervisor**: output streaming, progress and exit status of real scripts
//! - **checks**: probes run through `spawn_checks`
//! - **cli**: the binary's argument handling and exit codes

mod checks;
mod cli;
mod lock;
mod self_update;
mod supervisor;
