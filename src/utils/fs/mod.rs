//! File system utilities for installation trees.
//!
//! - [`atomic`]: write-to-temp-then-rename for small marker files
//! - [`dirs`]: directory creation, permission-preserving tree copy, removal

pub mod atomic;
pub mod dirs;

pub use atomic::{atomic_write, safe_write};
pub use dirs::{copy_tree, ensure_dir, remove_dir_all};
