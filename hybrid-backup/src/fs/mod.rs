//! File system helpers for the storage tree.

pub mod metadata;
pub mod walker;

pub use walker::{locate_artifact, scan_storage, StorageStats};
