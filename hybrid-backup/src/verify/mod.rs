//! Integrity Verifier: structural checks on an archive or extracted unit.
//!
//! Verification never touches live state. Archives are extracted into a
//! private temporary directory that is removed afterwards, so running the
//! verifier twice on the same input gives the same report.

use crate::archive;
use crate::config::Config;
use crate::db::DatabaseBackend;
use crate::executor::blocking;
use crate::executor::manifest::{Manifest, DATABASE_FILE, MANIFEST_FILE, STORAGE_FILE};
use crate::fs::locate_artifact;
use crate::transfer::progress::format_bytes;
use crate::transfer::{ChecksumSet, CHECKSUM_FILE};
use crate::utils::errors::{BackupError, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One verification item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub checks: Vec<Check>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let _ = writeln!(
                out,
                "[{}] {}: {}",
                if check.passed { "PASS" } else { "FAIL" },
                check.name,
                check.detail
            );
        }
        out
    }

    /// Convert a failed report into an error; checksum problems keep their
    /// own class.
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            return Ok(self);
        }
        let checksum_failed = self
            .checks
            .iter()
            .any(|c| c.name == "checksums" && !c.passed);
        if checksum_failed {
            Err(BackupError::ChecksumMismatch(self.failures()))
        } else {
            Err(BackupError::Integrity(self.failures()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    search_depth: usize,
    min_dump_bytes: u64,
    work_dir: PathBuf,
}

impl IntegrityVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            search_depth: config.backup.search_depth,
            min_dump_bytes: config.verify.min_dump_bytes,
            work_dir: config.work_dir().to_path_buf(),
        }
    }

    /// Verify an archive file or an already extracted directory. When
    /// `dry_run` is given, the dump's table of contents is also read by the
    /// database tooling.
    pub async fn verify<D: DatabaseBackend>(
        &self,
        path: &Path,
        dry_run: Option<&D>,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport> {
        if !path.exists() {
            return Err(BackupError::MissingInput(format!(
                "{} does not exist",
                path.display()
            )));
        }

        // Held until the end of this function; removed on drop.
        let mut _extracted = None;
        let root = if path.is_dir() {
            path.to_path_buf()
        } else {
            std::fs::create_dir_all(&self.work_dir)?;
            let dir = tempfile::Builder::new()
                .prefix(".verify-")
                .tempdir_in(&self.work_dir)?;
            let src = path.to_path_buf();
            let dest = dir.path().to_path_buf();
            if let Err(e) = blocking(move || archive::unpack(&src, &dest)).await {
                return Ok(VerificationReport {
                    checks: vec![Check::fail("archive", format!("cannot extract: {}", e))],
                });
            }
            let root = dir.path().to_path_buf();
            _extracted = Some(dir);
            root
        };

        let mut report = self.verify_dir(&root);

        if let Some(db) = dry_run {
            let check = match locate_artifact(&root, DATABASE_FILE, self.search_depth) {
                Ok(dump) => match db.dry_run(&dump, cancel).await {
                    Ok(()) => Check::pass("dry-run restore", "table of contents readable"),
                    Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                    Err(e) => Check::fail("dry-run restore", e.to_string()),
                },
                Err(e) => Check::fail("dry-run restore", e.to_string()),
            };
            report.checks.push(check);
        }

        info!(
            "Verification of {} {}",
            path.display(),
            if report.passed() { "passed" } else { "FAILED" }
        );
        Ok(report)
    }

    /// Structural checks on an extracted unit.
    pub fn verify_dir(&self, root: &Path) -> VerificationReport {
        let mut checks = Vec::new();

        let dump = locate_artifact(root, DATABASE_FILE, self.search_depth);
        checks.push(match &dump {
            Ok(path) => match std::fs::metadata(path) {
                Ok(m) if m.len() >= self.min_dump_bytes => {
                    Check::pass("database dump", format!("{} ({})", DATABASE_FILE, format_bytes(m.len())))
                }
                Ok(m) => Check::fail(
                    "database dump",
                    format!("{} is only {} bytes", DATABASE_FILE, m.len()),
                ),
                Err(e) => Check::fail("database dump", e.to_string()),
            },
            Err(e) => Check::fail("database dump", e.to_string()),
        });

        let manifest_path = locate_artifact(root, MANIFEST_FILE, self.search_depth);
        let manifest = manifest_path.as_ref().ok().map(|p| (p.clone(), Manifest::load(p)));
        checks.push(match (&manifest_path, &manifest) {
            (Err(e), _) => Check::fail("manifest", e.to_string()),
            (Ok(_), Some((_, Ok(m)))) => Check::pass(
                "manifest",
                format!("{} version {} by {}", m.timestamp, m.version, m.created_by),
            ),
            (Ok(_), Some((_, Err(e)))) => Check::fail("manifest", e.to_string()),
            (Ok(_), None) => Check::fail("manifest", "unreadable"),
        });

        // The unit root is where the manifest lives, else where the dump is.
        let unit_root = match (&manifest_path, &dump) {
            (Ok(p), _) | (Err(_), Ok(p)) => p.parent().map(Path::to_path_buf),
            _ => None,
        };

        if let (Some(unit_root), Some((_, Ok(manifest)))) = (&unit_root, &manifest) {
            let missing: Vec<&str> = manifest
                .components()
                .into_iter()
                .filter(|c| !unit_root.join(c).is_file())
                .collect();
            checks.push(if missing.is_empty() {
                Check::pass("components", manifest.components().join(", "))
            } else {
                Check::fail("components", format!("missing: {}", missing.join(", ")))
            });
        }

        if let Some(unit_root) = &unit_root {
            let storage = unit_root.join(STORAGE_FILE);
            checks.push(if storage.is_file() {
                match archive::count_entries(&storage) {
                    Ok(files) => Check::pass("storage archive", format!("{} file(s)", files)),
                    Err(e) => Check::fail("storage archive", format!("unreadable: {}", e)),
                }
            } else {
                Check::fail("storage archive", format!("{} not found", STORAGE_FILE))
            });

            let checksum_file = unit_root.join(CHECKSUM_FILE);
            checks.push(if checksum_file.is_file() {
                match ChecksumSet::load(&checksum_file) {
                    Ok(set) => {
                        let problems = set.verify(unit_root);
                        if problems.is_empty() {
                            Check::pass("checksums", format!("{} digest(s) match", set.len()))
                        } else {
                            Check::fail("checksums", problems.join("; "))
                        }
                    }
                    Err(e) => Check::fail("checksums", e.to_string()),
                }
            } else {
                Check::pass("checksums", "no digest file, skipped")
            });
        }

        VerificationReport { checks }
    }
}
