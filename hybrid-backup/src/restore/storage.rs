//! Copy-first replacement of the live storage tree.

use crate::archive;
use crate::fs::walker::{clear_dir, copy_tree};
use crate::fs::{scan_storage, StorageStats};
use crate::utils::errors::{BackupError, Result};
use std::path::Path;
use tempfile::TempDir;
use tracing::{error, info, warn};

/// Replace the contents of `live` with the tree in `storage_archive`.
///
/// The live tree is copied into a temporary safety directory under
/// `work_dir` first. If extraction fails the live tree is restored from that
/// copy and [`BackupError::StorageRolledBack`] is returned. The safety copy
/// is removed afterwards, unless the rollback itself fails: then it is kept
/// and its path is carried by [`BackupError::StorageRollbackFailed`].
pub fn swap_storage(live: &Path, storage_archive: &Path, work_dir: &Path) -> Result<StorageStats> {
    std::fs::create_dir_all(work_dir)?;
    let safety = tempfile::Builder::new()
        .prefix(".storage-safety-")
        .tempdir_in(work_dir)?;

    let saved = if live.is_dir() {
        copy_tree(live, safety.path())?
    } else {
        0
    };
    info!("Saved {} live storage file(s) to {}", saved, safety.path().display());

    match replace(live, storage_archive) {
        Ok(()) => {
            let stats = scan_storage(live)?;
            info!("Storage restored: {} file(s)", stats.files);
            Ok(stats)
        }
        Err(e) => {
            error!("Storage extraction failed, rolling back: {}", e);
            rollback(live, safety)?;
            Err(BackupError::StorageRolledBack(e.to_string()))
        }
    }
}

fn replace(live: &Path, storage_archive: &Path) -> Result<()> {
    clear_dir(live)?;
    archive::unpack(storage_archive, live)
}

fn rollback(live: &Path, safety: TempDir) -> Result<()> {
    let restored = clear_dir(live).and_then(|_| copy_tree(safety.path(), live));
    match restored {
        Ok(files) => {
            warn!("Rolled back live storage ({} file(s))", files);
            Ok(())
        }
        Err(e) => {
            // The copy is now the only complete version of the old tree.
            let kept = safety.keep();
            error!(
                "Storage rollback failed: {}; previous storage kept at {}",
                e,
                kept.display()
            );
            Err(BackupError::StorageRollbackFailed {
                kept,
                reason: e.to_string(),
            })
        }
    }
}
