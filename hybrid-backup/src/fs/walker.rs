//! Directory traversal for storage scans, artifact lookup and tree copies.

use crate::utils::errors::{BackupError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Self> {
        let metadata = entry.path().symlink_metadata()?;
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();

        Ok(Self {
            relative_path,
            size: metadata.len(),
        })
    }
}

/// Aggregate view of a storage tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageStats {
    pub files: u64,
    pub bytes: u64,

    /// `(relative path, size)` sorted by path
    pub listing: Vec<(String, u64)>,
}

/// Walk a directory tree without following links and collect every
/// non-directory entry, sorted by relative path.
pub fn walk_directory(root: &Path) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

/// Count files and bytes under the storage root. A missing root is an
/// empty store.
pub fn scan_storage(root: &Path) -> Result<StorageStats> {
    if !root.exists() {
        return Ok(StorageStats::default());
    }

    let files = walk_directory(root)?;
    let listing: Vec<(String, u64)> = files
        .iter()
        .map(|f| (f.relative_path.to_string_lossy().into_owned(), f.size))
        .collect();

    Ok(StorageStats {
        files: listing.len() as u64,
        bytes: listing.iter().map(|(_, size)| size).sum(),
        listing,
    })
}

/// Find a regular file named `name` anywhere under `root`, descending at
/// most `max_depth` levels. The shallowest match wins.
pub fn locate_artifact(root: &Path, name: &str, max_depth: usize) -> Result<PathBuf> {
    let mut best: Option<(usize, PathBuf)> = None;

    for entry in WalkDir::new(root)
        .follow_links(false)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name() != name {
            continue;
        }
        let depth = entry.depth();
        if best.as_ref().map_or(true, |(d, _)| depth < *d) {
            best = Some((depth, entry.into_path()));
        }
    }

    best.map(|(_, path)| path)
        .ok_or_else(|| BackupError::ArtifactNotFound {
            name: name.to_string(),
            root: root.to_path_buf(),
        })
}

/// Recursively copy `src` into `dst`, preserving permissions and symlinks.
/// Returns the number of files copied.
///
/// Directory modes are applied after the walk, deepest first, so read-only
/// source directories still receive their children.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    let mut dir_modes = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            dir_modes.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    for (dir, permissions) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, permissions)?;
    }

    Ok(copied)
}

/// Remove everything inside `dir`, keeping the directory itself (it may be
/// a mount point with its own ownership).
pub fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let file_type = path.symlink_metadata()?.file_type();
        if file_type.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path())?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].relative_path, PathBuf::from("subdir/file2.txt"));
        Ok(())
    }

    #[test]
    fn test_walk_lists_symlinks_without_following() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("real"))?;
        fs::write(temp_dir.path().join("real/file.txt"), b"content")?;
        std::os::unix::fs::symlink("real", temp_dir.path().join("link"))?;

        let files = walk_directory(temp_dir.path())?;
        let names: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("link"), PathBuf::from("real/file.txt")]);
        Ok(())
    }

    #[test]
    fn test_scan_storage_counts_files_and_bytes() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("2024/01"))?;
        fs::write(temp_dir.path().join("a.pdf"), b"12345")?;
        fs::write(temp_dir.path().join("2024/01/b.pdf"), b"1234567")?;

        let stats = scan_storage(temp_dir.path())?;
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 12);
        assert_eq!(
            stats.listing,
            vec![("2024/01/b.pdf".to_string(), 7), ("a.pdf".to_string(), 5)]
        );
        Ok(())
    }

    #[test]
    fn test_scan_missing_storage_is_empty() -> Result<()> {
        let stats = scan_storage(Path::new("/nonexistent/storage/root"))?;
        assert_eq!(stats, StorageStats::default());
        Ok(())
    }

    #[test]
    fn test_locate_artifact_in_nested_tree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let nested = temp_dir.path().join("backup_20240101_120000");
        fs::create_dir_all(&nested)?;
        fs::write(nested.join("database.dump"), b"PGDMP")?;

        let found = locate_artifact(temp_dir.path(), "database.dump", 4)?;
        assert_eq!(found, nested.join("database.dump"));
        Ok(())
    }

    #[test]
    fn test_locate_artifact_respects_depth_bound() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let deep = temp_dir.path().join("a/b/c/d/e");
        fs::create_dir_all(&deep)?;
        fs::write(deep.join("database.dump"), b"PGDMP")?;

        let result = locate_artifact(temp_dir.path(), "database.dump", 3);
        assert!(matches!(result, Err(BackupError::ArtifactNotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_copy_and_clear_tree() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;

        fs::create_dir_all(src.path().join("docs"))?;
        fs::write(src.path().join("docs/report.pdf"), b"pdf")?;
        fs::write(src.path().join("top.txt"), b"top")?;
        std::os::unix::fs::symlink("top.txt", src.path().join("alias"))?;

        let copied = copy_tree(src.path(), &dst.path().join("copy"))?;
        assert_eq!(copied, 3);
        assert_eq!(fs::read(dst.path().join("copy/docs/report.pdf"))?, b"pdf");
        assert_eq!(
            fs::read_link(dst.path().join("copy/alias"))?,
            PathBuf::from("top.txt")
        );

        clear_dir(&dst.path().join("copy"))?;
        assert!(dst.path().join("copy").exists());
        assert_eq!(fs::read_dir(dst.path().join("copy"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_copy_tree_with_read_only_directories() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let archive = src.path().join("archive");
        fs::create_dir_all(archive.join("2023"))?;
        fs::write(archive.join("2023/ledger.pdf"), b"ledger")?;
        fs::write(archive.join("index.txt"), b"index")?;
        fs::set_permissions(archive.join("2023"), fs::Permissions::from_mode(0o555))?;
        fs::set_permissions(&archive, fs::Permissions::from_mode(0o555))?;

        let copied = copy_tree(src.path(), dst.path());

        // Restore write access so both temp dirs can be removed.
        for root in [src.path(), dst.path()] {
            for dir in [root.join("archive"), root.join("archive/2023")] {
                if dir.is_dir() {
                    fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
                }
            }
        }

        assert_eq!(copied?, 2);
        assert_eq!(fs::read(dst.path().join("archive/2023/ledger.pdf"))?, b"ledger");
        assert_eq!(fs::read(dst.path().join("archive/index.txt"))?, b"index");
        Ok(())
    }

    #[test]
    fn test_copy_tree_keeps_directory_modes() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::create_dir_all(src.path().join("sealed/inner"))?;
        fs::write(src.path().join("sealed/inner/a.txt"), b"a")?;
        fs::set_permissions(src.path().join("sealed/inner"), fs::Permissions::from_mode(0o550))?;
        fs::set_permissions(src.path().join("sealed"), fs::Permissions::from_mode(0o750))?;

        copy_tree(src.path(), dst.path())?;

        let mode = |p: &Path| fs::metadata(p).map(|m| m.permissions().mode() & 0o777);
        assert_eq!(mode(&dst.path().join("sealed"))?, 0o750);
        assert_eq!(mode(&dst.path().join("sealed/inner"))?, 0o550);

        for root in [src.path(), dst.path()] {
            fs::set_permissions(root.join("sealed/inner"), fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }
}
