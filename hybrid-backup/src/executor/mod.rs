//! Backup executor - produces a staged backup unit and packages it.
//!
//! A unit is staged in a fresh, uniquely named directory in three ordered
//! steps (database dump, storage archive, manifest). Any failure drops the
//! staging directory, so a partial unit never survives.

pub mod manifest;
pub mod packager;
pub mod retention;

use crate::archive;
use crate::config::{Compression, Config};
use crate::daemon::OperationLock;
use crate::db::DatabaseBackend;
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{BackupError, Result, Stage};
use chrono::{DateTime, Local};
use manifest::{default_creator, Manifest, DATABASE_FILE, STORAGE_FILE};
use std::future::Future;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use packager::{ArchivePackager, PackagedArchive};

/// Run one numbered step: announce it, then log an explicit success or
/// failure line and tag any error with the stage.
pub(crate) async fn run_stage<T, F>(stage: Stage, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!("{}", stage);
    match step.await {
        Ok(value) => {
            info!("{} ... done", stage);
            Ok(value)
        }
        Err(e) => {
            error!("{} ... FAILED: {}", stage, e);
            Err(BackupError::at(stage, e))
        }
    }
}

pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(BackupError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run blocking file work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
}

/// A staged backup unit. Dropping it deletes the staging directory.
#[derive(Debug)]
pub struct BackupUnit {
    dir: TempDir,
    pub name: String,
    pub timestamp: DateTime<Local>,
    pub manifest: Manifest,
}

impl BackupUnit {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn database_dump(&self) -> PathBuf {
        self.path().join(DATABASE_FILE)
    }

    pub fn storage_archive(&self) -> PathBuf {
        self.path().join(STORAGE_FILE)
    }
}

/// Unit name for a timestamp, second granularity.
pub fn unit_name(timestamp: &DateTime<Local>) -> String {
    format!("backup_{}", timestamp.format("%Y%m%d_%H%M%S"))
}

/// Snapshot Coordinator
pub struct SnapshotCoordinator<D> {
    config: Config,
    db: D,
    cancel: CancellationToken,
}

impl<D: DatabaseBackend> SnapshotCoordinator<D> {
    pub fn new(config: Config, db: D, cancel: CancellationToken) -> Self {
        Self { config, db, cancel }
    }

    /// Take the lock, stage a unit, package it and apply retention.
    pub async fn run(&self, backup_type: &str) -> Result<PackagedArchive> {
        let started = std::time::Instant::now();
        let _lock =
            OperationLock::acquire(&self.config.lock_path(), self.config.timeouts.lock_wait()).await?;

        let unit = self.stage(backup_type).await?;
        ensure_not_cancelled(&self.cancel)?;

        let packager = ArchivePackager::new(
            self.config.backup.dir.clone(),
            self.config.backup.compression,
            self.config.backup.compression_level,
        );
        let packaged = run_stage(Stage::BackupPackage, packager.package(unit)).await?;

        info!(
            "Backup complete: {} ({}) in {}",
            packaged.path.display(),
            format_bytes(packaged.size),
            crate::transfer::progress::format_duration(started.elapsed())
        );

        if let Some(keep) = self.config.backup.keep {
            match retention::prune(&self.config.backup.dir, keep) {
                Ok(removed) if !removed.is_empty() => {
                    info!("Retention removed {} old backup(s)", removed.len())
                }
                Ok(_) => {}
                Err(e) => warn!("Retention pruning failed: {}", e),
            }
        }

        Ok(packaged)
    }

    /// Produce a staged unit: dump, storage archive, manifest.
    pub async fn stage(&self, backup_type: &str) -> Result<BackupUnit> {
        let timestamp = Local::now();
        let name = unit_name(&timestamp);

        std::fs::create_dir_all(self.config.work_dir())?;
        let dir = tempfile::Builder::new()
            .prefix(&format!(".staging-{}-", name))
            .tempdir_in(self.config.work_dir())?;
        info!("Staging {} in {}", name, dir.path().display());

        let dump_path = dir.path().join(DATABASE_FILE);
        run_stage(Stage::BackupDatabase, self.dump_database(&dump_path)).await?;
        ensure_not_cancelled(&self.cancel)?;

        let storage_archive = dir.path().join(STORAGE_FILE);
        run_stage(Stage::BackupStorage, self.archive_storage(storage_archive)).await?;
        ensure_not_cancelled(&self.cancel)?;

        let manifest = Manifest::new(
            timestamp,
            self.config.app_version(),
            backup_type,
            default_creator(),
        );
        let staged = dir.path().to_path_buf();
        let written = manifest.clone();
        run_stage(Stage::BackupManifest, async move {
            written.write_new(&staged).map(|_| ())
        })
        .await?;

        Ok(BackupUnit {
            dir,
            name,
            timestamp,
            manifest,
        })
    }

    async fn dump_database(&self, dest: &Path) -> Result<()> {
        self.db.dump(dest, &self.cancel).await?;

        let size = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(BackupError::EmptyArtifact(dest.to_path_buf()));
        }
        info!("Database dump written ({})", format_bytes(size));
        Ok(())
    }

    async fn archive_storage(&self, dest: PathBuf) -> Result<()> {
        let root = self.config.storage.path.clone();
        let level = self.config.backup.compression_level;

        let size = blocking(move || {
            if root.is_dir() {
                archive::pack_dir(&root, &dest, ".", Compression::Gzip, level)
            } else {
                warn!("Storage path {} does not exist, archiving empty tree", root.display());
                let empty = TempDir::new()?;
                archive::pack_dir(empty.path(), &dest, ".", Compression::Gzip, level)
            }
        })
        .await?;

        info!("Storage archive written ({})", format_bytes(size));
        Ok(())
    }
}
