//! Cross-cutting utilities: filesystem helpers and terminal progress styles.

pub mod fs;
pub mod progress;

pub use fs::{atomic_write, copy_tree, ensure_dir, remove_dir_all, safe_write};
