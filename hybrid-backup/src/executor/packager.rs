//! Archive Packager: compresses a staged unit into one shippable file.

use super::manifest::Manifest;
use super::{blocking, BackupUnit};
use crate::archive;
use crate::config::Compression;
use crate::transfer::ChecksumSet;
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Collision suffixes tried before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Result of packaging a unit.
#[derive(Debug, Clone)]
pub struct PackagedArchive {
    pub path: PathBuf,
    pub size: u64,
    pub checksums: ChecksumSet,
    pub manifest: Manifest,
}

#[derive(Debug, Clone)]
pub struct ArchivePackager {
    backup_dir: PathBuf,
    compression: Compression,
    level: u32,
}

impl ArchivePackager {
    pub fn new(backup_dir: PathBuf, compression: Compression, level: u32) -> Self {
        Self {
            backup_dir,
            compression,
            level,
        }
    }

    /// Digest, compress and verify a unit. The staging directory is removed
    /// when `unit` drops, whichever way this returns; a partial archive is
    /// deleted on failure.
    pub async fn package(&self, unit: BackupUnit) -> Result<PackagedArchive> {
        fs::create_dir_all(&self.backup_dir)?;

        let checksums = ChecksumSet::generate(unit.path())?;
        checksums.write(unit.path())?;
        info!("Computed SHA-256 digests for {} file(s)", checksums.len());

        let (archive_path, root) = reserve_archive_path(
            &self.backup_dir,
            &unit.name,
            self.compression.extension(),
        )?;

        let src = unit.path().to_path_buf();
        let dest = archive_path.clone();
        let compression = self.compression;
        let level = self.level;
        let packed = blocking(move || archive::pack_dir(&src, &dest, &root, compression, level)).await;

        let size = settle(&archive_path, packed)?;

        Ok(PackagedArchive {
            path: archive_path,
            size,
            checksums,
            manifest: unit.manifest.clone(),
        })
    }
}

/// Claim `<dir>/<name>.<ext>`, appending `_1`, `_2`, ... when two units
/// share a second. Returns the path and the in-archive root name.
fn reserve_archive_path(dir: &Path, name: &str, extension: &str) -> Result<(PathBuf, String)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let root = if attempt == 0 {
            name.to_string()
        } else {
            format!("{}_{}", name, attempt)
        };
        let path = dir.join(format!("{}.{}", root, extension));

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok((path, root)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(BackupError::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free archive name for {}", name),
    )))
}

/// Keep the archive only if packing produced a non-empty file.
fn settle(archive_path: &Path, packed: Result<u64>) -> Result<u64> {
    match packed {
        Ok(0) => {
            discard_partial(archive_path);
            Err(BackupError::EmptyArtifact(archive_path.to_path_buf()))
        }
        Ok(size) => Ok(size),
        Err(e) => {
            discard_partial(archive_path);
            Err(e)
        }
    }
}

fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove partial archive {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::unit_name;
    use chrono::Local;
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    fn staged_unit(work_dir: &Path) -> Result<BackupUnit> {
        let timestamp = Local::now();
        let name = unit_name(&timestamp);
        let dir = tempfile::Builder::new()
            .prefix(&format!(".staging-{}-", name))
            .tempdir_in(work_dir)?;
        fs::write(dir.path().join("database.dump"), b"PGDMP")?;
        fs::write(dir.path().join("storage.tar.gz"), b"storage")?;

        Ok(BackupUnit {
            dir,
            name,
            timestamp,
            manifest: Manifest::new(timestamp, "1.0.0", "manual", "tests"),
        })
    }

    fn leftovers(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with("backup_") || name.starts_with(".staging-") {
                names.push(name);
            }
        }
        Ok(names)
    }

    #[tokio::test]
    async fn test_failed_pack_removes_archive_and_staging() -> Result<()> {
        let temp = TempDir::new()?;
        let unit = staged_unit(temp.path())?;
        // tar refuses to archive sockets.
        let _socket = UnixListener::bind(unit.path().join("app.sock"))?;

        let packager = ArchivePackager::new(temp.path().to_path_buf(), Compression::Gzip, 6);
        let result = packager.package(unit).await;

        assert!(result.is_err());
        assert_eq!(leftovers(temp.path())?, Vec::<String>::new());
        Ok(())
    }

    #[tokio::test]
    async fn test_unusable_backup_dir_removes_staging() -> Result<()> {
        let temp = TempDir::new()?;
        let work = temp.path().join("work");
        fs::create_dir(&work)?;
        let backup_dir = temp.path().join("backups");
        fs::write(&backup_dir, b"not a directory")?;

        let unit = staged_unit(&work)?;
        let packager = ArchivePackager::new(backup_dir, Compression::Zstd, 3);
        assert!(packager.package(unit).await.is_err());

        assert_eq!(leftovers(&work)?, Vec::<String>::new());
        assert_eq!(leftovers(temp.path())?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn test_zero_size_archive_is_discarded() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("backup_20240101_120000.tar.gz");
        fs::write(&path, b"")?;

        let err = settle(&path, Ok(0)).unwrap_err();
        assert!(matches!(err, BackupError::EmptyArtifact(_)));
        assert!(!path.exists());

        fs::write(&path, b"partial")?;
        let err = settle(&path, Err(BackupError::Cancelled)).unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(!path.exists());

        fs::write(&path, b"complete")?;
        assert_eq!(settle(&path, Ok(8))?, 8);
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_reserve_archive_path_avoids_collisions() -> Result<()> {
        let dir = TempDir::new()?;

        let (first, root1) = reserve_archive_path(dir.path(), "backup_20240101_120000", "tar.gz")?;
        let (second, root2) = reserve_archive_path(dir.path(), "backup_20240101_120000", "tar.gz")?;

        assert_eq!(first, dir.path().join("backup_20240101_120000.tar.gz"));
        assert_eq!(second, dir.path().join("backup_20240101_120000_1.tar.gz"));
        assert_eq!(root1, "backup_20240101_120000");
        assert_eq!(root2, "backup_20240101_120000_1");
        Ok(())
    }

    #[test]
    fn test_discard_partial_ignores_missing() {
        discard_partial(Path::new("/nonexistent/partial.tar.gz"));
    }
}
