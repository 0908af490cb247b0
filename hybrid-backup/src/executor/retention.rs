//! Listing and pruning of packaged archives in the backup directory.

use crate::utils::errors::Result;
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const ARCHIVE_PREFIX: &str = "backup_";
const ARCHIVE_EXTENSIONS: [&str; 2] = [".tar.gz", ".tar.zst"];

/// A packaged archive on disk.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Local>,
}

fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Every archive in `dir`, newest first. Names embed the timestamp, so
/// name order is creation order.
pub fn list_archives(dir: &Path) -> Result<Vec<ArchiveEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_archive_name(&name) || !entry.file_type()?.is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        archives.push(ArchiveEntry {
            path: entry.path(),
            name,
            size: metadata.len(),
            modified: metadata.modified()?.into(),
        });
    }

    archives.sort_by(|a, b| b.name.cmp(&a.name));
    Ok(archives)
}

/// Remove all but the newest `keep` archives; returns what was removed.
pub fn prune(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for old in list_archives(dir)?.into_iter().skip(keep) {
        fs::remove_file(&old.path)?;
        info!("Removed old backup: {}", old.name);
        removed.push(old.path);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_is_newest_first_and_filtered() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("backup_20240101_000000.tar.gz"), b"a")?;
        fs::write(dir.path().join("backup_20240301_000000.tar.zst"), b"bb")?;
        fs::write(dir.path().join("backup_20240201_000000.tar.gz"), b"ccc")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;
        fs::create_dir(dir.path().join("safety"))?;

        let names: Vec<String> = list_archives(dir.path())?.into_iter().map(|a| a.name).collect();
        assert_eq!(
            names,
            vec![
                "backup_20240301_000000.tar.zst",
                "backup_20240201_000000.tar.gz",
                "backup_20240101_000000.tar.gz",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_prune_keeps_newest() -> Result<()> {
        let dir = TempDir::new()?;
        for day in 1..=5 {
            fs::write(dir.path().join(format!("backup_202401{:02}_000000.tar.gz", day)), b"x")?;
        }

        let removed = prune(dir.path(), 2)?;
        assert_eq!(removed.len(), 3);

        let left: Vec<String> = list_archives(dir.path())?.into_iter().map(|a| a.name).collect();
        assert_eq!(
            left,
            vec!["backup_20240105_000000.tar.gz", "backup_20240104_000000.tar.gz"]
        );
        Ok(())
    }

    #[test]
    fn test_missing_dir_lists_nothing() -> Result<()> {
        assert!(list_archives(Path::new("/nonexistent/backups"))?.is_empty());
        Ok(())
    }
}
