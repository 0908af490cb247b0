//! Hybrid backup library
//!
//! Coordinated backup and restore of a relational database together with
//! the filesystem tree of uploaded content it references.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod db;
pub mod executor;
pub mod fs;
pub mod process;
pub mod restore;
pub mod safety;
pub mod services;
pub mod state;
pub mod transfer;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
