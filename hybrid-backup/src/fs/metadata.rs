//! Ownership and permission audit of the restored storage tree.
//!
//! Deviations are cosmetic: they are reported as warnings by the validator
//! and never fail a restore.

use crate::utils::errors::{BackupError, Result};
use nix::unistd::{Uid, User};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Ownership and mode of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Permission bits (lower 12 bits of st_mode)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileMetadata {
    /// Extract metadata from a file path without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        Ok(Self {
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
        })
    }
}

/// A file whose ownership or mode is outside the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDeviation {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for PermissionDeviation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Resolve a user name to its uid.
pub fn resolve_owner(name: &str) -> Result<Uid> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(BackupError::Config(format!("unknown storage owner: {}", name))),
        Err(errno) => Err(BackupError::Io(std::io::Error::from(errno))),
    }
}

/// Check every entry under `root` against the allowed modes and the
/// expected owner. Symlinks are skipped; their mode is meaningless.
pub fn audit_tree(
    root: &Path,
    allowed_modes: &[u32],
    owner: Option<Uid>,
) -> Result<Vec<PermissionDeviation>> {
    let mut deviations = Vec::new();
    if !root.exists() {
        return Ok(deviations);
    }

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_symlink() {
            continue;
        }

        let metadata = FileMetadata::from_path(entry.path())?;

        if !allowed_modes.is_empty() && !allowed_modes.contains(&metadata.mode) {
            deviations.push(PermissionDeviation {
                path: entry.path().to_path_buf(),
                reason: format!("mode {:o} not in allow-list", metadata.mode),
            });
        }

        if let Some(uid) = owner {
            if metadata.uid != uid.as_raw() {
                deviations.push(PermissionDeviation {
                    path: entry.path().to_path_buf(),
                    reason: format!("owned by uid {} instead of {}", metadata.uid, uid),
                });
            }
        }
    }

    Ok(deviations)
}
