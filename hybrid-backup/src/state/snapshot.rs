//! Point-in-time counts of domain entities and the storage tree.
//!
//! Reports are stable, line-labeled text files:
//!
//! ```text
//! # hybrid-backup state snapshot
//! Timestamp: 2024-03-01T12:30:05+00:00
//! Documents: 5
//! Users: 3
//! ...
//! --- storage listing ---
//! invoices/2024/a.pdf	5120
//! ```

use crate::db::AdminQueries;
use crate::fs::{scan_storage, StorageStats};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local, SecondsFormat};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

const HEADER: &str = "# hybrid-backup state snapshot";
const LISTING_MARKER: &str = "--- storage listing ---";
const REPORT_PREFIX: &str = "state_snapshot_";

pub const DOCUMENTS: &str = "Documents";
pub const USERS: &str = "Users";
pub const FILES: &str = "Files";
pub const VERSIONS: &str = "Versions";
pub const WORKFLOWS: &str = "Workflow instances";
pub const STORAGE_FILES: &str = "Storage files";
pub const STORAGE_BYTES: &str = "Storage bytes";

#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Local>,
    pub documents: u64,
    pub users: u64,
    pub files: u64,
    pub versions: u64,
    pub workflow_instances: u64,
    pub storage: StorageStats,
}

impl StateSnapshot {
    /// Run the count queries and scan the storage tree.
    pub async fn capture<A: AdminQueries>(
        admin: &A,
        storage_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let taken_at = Local::now();

        let documents = admin.count_documents(cancel).await?;
        let users = admin.count_users(cancel).await?;
        let files = admin.count_files(cancel).await?;
        let versions = admin.count_versions(cancel).await?;
        let workflow_instances = admin.count_workflow_instances(cancel).await?;

        let root = storage_root.to_path_buf();
        let storage = crate::executor::blocking(move || scan_storage(&root)).await?;

        info!(
            "Snapshot: {} documents, {} users, {} files, {} versions, {} storage files",
            documents, users, files, versions, storage.files
        );

        Ok(Self {
            taken_at,
            documents,
            users,
            files,
            versions,
            workflow_instances,
            storage,
        })
    }

    /// Labeled metrics in report order.
    pub fn metrics(&self) -> Vec<(&'static str, u64)> {
        vec![
            (DOCUMENTS, self.documents),
            (USERS, self.users),
            (FILES, self.files),
            (VERSIONS, self.versions),
            (WORKFLOWS, self.workflow_instances),
            (STORAGE_FILES, self.storage.files),
            (STORAGE_BYTES, self.storage.bytes),
        ]
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER);
        out.push('\n');
        out.push_str(&format!(
            "Timestamp: {}\n",
            self.taken_at.to_rfc3339_opts(SecondsFormat::Secs, false)
        ));
        for (label, value) in self.metrics() {
            out.push_str(&format!("{}: {}\n", label, value));
        }
        out.push_str(LISTING_MARKER);
        out.push('\n');
        for (path, size) in &self.storage.listing {
            out.push_str(&format!("{}\t{}\n", path, size));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render())?;
        info!("State report written to {}", path.display());
        Ok(())
    }
}

/// A report read back from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub timestamp: Option<String>,
    /// Metrics in file order
    pub metrics: Vec<(String, u64)>,
    pub listing: Vec<(String, u64)>,
}

impl Report {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BackupError::MissingInput(format!("cannot read report {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut report = Report::default();
        let mut in_listing = false;

        for line in content.lines() {
            if line.trim() == LISTING_MARKER {
                in_listing = true;
                continue;
            }
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            if in_listing {
                if let Some((path, size)) = line.rsplit_once('\t') {
                    if let Ok(size) = size.trim().parse() {
                        report.listing.push((path.to_string(), size));
                    }
                }
                continue;
            }

            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let (label, value) = (label.trim(), value.trim());
            if label == "Timestamp" {
                report.timestamp = Some(value.to_string());
            } else if let Ok(value) = value.parse::<u64>() {
                report.metrics.push((label.to_string(), value));
            }
        }

        if report.metrics.is_empty() {
            return Err(BackupError::MissingInput(
                "report contains no labeled metrics".to_string(),
            ));
        }
        Ok(report)
    }

    pub fn metric(&self, label: &str) -> Option<u64> {
        self.metrics
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| *v)
    }
}

/// `<dir>/state_snapshot_YYYYMMDD_HHMMSS.txt`
pub fn default_report_path(dir: &Path, now: &DateTime<Local>) -> PathBuf {
    dir.join(format!("{}{}.txt", REPORT_PREFIX, now.format("%Y%m%d_%H%M%S")))
}

/// Most recent `state_snapshot_*.txt` in `dir`.
pub fn latest_report(dir: &Path) -> Result<PathBuf> {
    let mut reports: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| {
            BackupError::MissingInput(format!("cannot read reports dir {}: {}", dir.display(), e))
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with(REPORT_PREFIX) && n.ends_with(".txt")
                })
                .unwrap_or(false)
        })
        .collect();

    reports.sort();
    reports.pop().ok_or_else(|| {
        BackupError::MissingInput(format!("no state snapshot reports in {}", dir.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            taken_at: Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            documents: 5,
            users: 3,
            files: 12,
            versions: 8,
            workflow_instances: 2,
            storage: StorageStats {
                files: 2,
                bytes: 30,
                listing: vec![("a.pdf".into(), 10), ("dir/b.pdf".into(), 20)],
            },
        }
    }

    #[test]
    fn test_render_is_line_labeled() {
        let text = snapshot().render();
        assert!(text.starts_with(HEADER));
        assert!(text.contains("\nDocuments: 5\n"));
        assert!(text.contains("\nWorkflow instances: 2\n"));
        assert!(text.contains("\ndir/b.pdf\t20\n"));
    }

    #[test]
    fn test_report_parses_rendered_snapshot() -> Result<()> {
        let report = Report::parse(&snapshot().render())?;
        assert_eq!(report.metric(DOCUMENTS), Some(5));
        assert_eq!(report.metric(STORAGE_BYTES), Some(30));
        assert_eq!(report.metrics.len(), 7);
        assert_eq!(report.listing.len(), 2);
        assert!(report.timestamp.unwrap().starts_with("2024-03-01T12:00:00"));
        Ok(())
    }

    #[test]
    fn test_report_without_metrics_is_rejected() {
        assert!(Report::parse("# nothing here\n").is_err());
    }

    #[test]
    fn test_latest_report() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("state_snapshot_20240101_000000.txt"), "Users: 1\n")?;
        fs::write(dir.path().join("state_snapshot_20240301_000000.txt"), "Users: 2\n")?;
        fs::write(dir.path().join("other.txt"), "Users: 3\n")?;

        let latest = latest_report(dir.path())?;
        assert_eq!(latest, dir.path().join("state_snapshot_20240301_000000.txt"));
        Ok(())
    }

    #[test]
    fn test_default_report_path() {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
        assert_eq!(
            default_report_path(Path::new("/reports"), &now),
            PathBuf::from("/reports/state_snapshot_20240301_090507.txt")
        );
    }
}
