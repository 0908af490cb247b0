//! Utility modules shared by every command.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result, Stage};
