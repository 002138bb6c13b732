//! Core types shared by every subsystem: the error taxonomy and its
//! user-facing rendering.

pub mod error;

pub use error::{ErrorCategory, ErrorContext, UpdaterError, user_friendly_error};
