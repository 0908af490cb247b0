//! Restore Coordinator: replaces the live database and storage tree with
//! the contents of a packaged archive.
//!
//! Steps:
//! 1. extract into a fresh temporary directory and locate the artifacts
//!    (nothing live is touched before this succeeds)
//! 2. restore the database with clean-and-recreate semantics
//! 3. swap the storage tree, rolling back from a copy on failure
//! 4. restart application services and wait for them to become healthy
//! 5. remove temporary trees
//!
//! Every temporary tree is a [`tempfile::TempDir`], so cleanup also happens
//! on error and cancellation paths.

pub mod storage;

use crate::archive;
use crate::config::Config;
use crate::daemon::OperationLock;
use crate::db::DatabaseBackend;
use crate::executor::manifest::{Manifest, DATABASE_FILE, MANIFEST_FILE, STORAGE_FILE};
use crate::executor::{blocking, ensure_not_cancelled, run_stage};
use crate::fs::locate_artifact;
use crate::safety::{SafetyBackup, SafetyNetManager};
use crate::services::{self, ServiceManager};
use crate::transfer::{ChecksumSet, CHECKSUM_FILE};
use crate::utils::errors::{BackupError, Result, Stage};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Token the operator must type to proceed.
pub const CONFIRM_TOKEN: &str = "yes";

/// Ask for confirmation on `output` and read the answer from `input`.
/// Anything but the literal token aborts.
pub fn confirm(archive: &Path, mut input: impl BufRead, mut output: impl Write) -> Result<()> {
    write!(
        output,
        "This will OVERWRITE the live database and storage with {}.\nType '{}' to continue: ",
        archive.display(),
        CONFIRM_TOKEN
    )?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    if answer.trim() == CONFIRM_TOKEN {
        Ok(())
    } else {
        Err(BackupError::Aborted)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Capture a safety backup of live state before mutating anything.
    pub safety_net: bool,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub archive: PathBuf,
    pub manifest: Option<Manifest>,
    pub storage_files: u64,
    pub storage_bytes: u64,
    pub safety_backup: Option<SafetyBackup>,
    pub failed_services: Vec<String>,
    pub healthy_services: usize,
}

/// Artifacts found in an extracted archive. Holds the extraction directory.
struct Extracted {
    _dir: TempDir,
    dump: PathBuf,
    storage: PathBuf,
    manifest: Option<Manifest>,
}

pub struct RestoreCoordinator<D, S> {
    config: Config,
    db: D,
    services: S,
    cancel: CancellationToken,
}

impl<D: DatabaseBackend, S: ServiceManager> RestoreCoordinator<D, S> {
    pub async fn run(&self, archive_path: &Path, options: RestoreOptions) -> Result<RestoreOutcome> {
        if !archive_path.is_file() {
            return Err(BackupError::MissingInput(format!(
                "archive {} does not exist",
                archive_path.display()
            )));
        }

        let _lock =
            OperationLock::acquire(&self.config.lock_path(), self.config.timeouts.lock_wait()).await?;

        let extracted = run_stage(Stage::RestoreExtract, self.extract(archive_path)).await?;
        ensure_not_cancelled(&self.cancel)?;

        let safety_backup = if options.safety_net {
            let backup = SafetyNetManager::new(&self.config, &self.db)
                .capture(&self.cancel)
                .await?;
            ensure_not_cancelled(&self.cancel)?;
            Some(backup)
        } else {
            None
        };

        run_stage(Stage::RestoreDatabase, self.restore_database(&extracted.dump)).await?;
        ensure_not_cancelled(&self.cancel)?;

        let live = self.config.storage.path.clone();
        let storage_archive = extracted.storage.clone();
        let work_dir = self.config.work_dir().to_path_buf();
        let stats = run_stage(
            Stage::RestoreStorage,
            blocking(move || storage::swap_storage(&live, &storage_archive, &work_dir)),
        )
        .await?;

        // Database and storage are replaced: services must drop their stale
        // connections and handles even if cancellation arrived meanwhile.
        let restart_cancel = self.restart_token();
        let (failed_services, healthy_services) =
            run_stage(Stage::RestoreServices, self.restart_services(&restart_cancel)).await?;

        let manifest = extracted.manifest.clone();
        run_stage(Stage::RestoreCleanup, async move {
            drop(extracted);
            Ok(())
        })
        .await?;

        Ok(RestoreOutcome {
            archive: archive_path.to_path_buf(),
            manifest,
            storage_files: stats.files,
            storage_bytes: stats.bytes,
            safety_backup,
            failed_services,
            healthy_services,
        })
    }

    async fn extract(&self, archive_path: &Path) -> Result<Extracted> {
        let work_dir = self.config.work_dir();
        std::fs::create_dir_all(work_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(work_dir)?;

        let src = archive_path.to_path_buf();
        let dest = dir.path().to_path_buf();
        blocking(move || archive::unpack(&src, &dest)).await?;
        info!("Extracted {} to {}", archive_path.display(), dir.path().display());

        let depth = self.config.backup.search_depth;
        let dump = locate_artifact(dir.path(), DATABASE_FILE, depth)?;
        let unit_root = dump.parent().unwrap_or(dir.path()).to_path_buf();
        let storage = locate_artifact(&unit_root, STORAGE_FILE, 1)?;

        let checksum_file = unit_root.join(CHECKSUM_FILE);
        if checksum_file.is_file() {
            let set = ChecksumSet::load(&checksum_file)?;
            set.ensure(&unit_root)?;
            info!("Verified {} SHA-256 digest(s)", set.len());
        } else {
            warn!("Archive carries no {}, skipping digest check", CHECKSUM_FILE);
        }

        let manifest_path = unit_root.join(MANIFEST_FILE);
        let manifest = if manifest_path.is_file() {
            let manifest = Manifest::load(&manifest_path)?;
            info!(
                "Archive created {} by {} (version {}, type {})",
                manifest.timestamp, manifest.created_by, manifest.version, manifest.backup_type
            );
            Some(manifest)
        } else {
            warn!("Archive carries no {}", MANIFEST_FILE);
            None
        };

        Ok(Extracted {
            _dir: dir,
            dump,
            storage,
            manifest,
        })
    }

    async fn restore_database(&self, dump: &Path) -> Result<()> {
        self.db.wait_ready(&self.cancel).await?;
        self.db.restore(dump, &self.cancel).await
    }
}

impl<D, S: ServiceManager> RestoreCoordinator<D, S> {
    pub fn new(config: Config, db: D, services: S, cancel: CancellationToken) -> Self {
        Self {
            config,
            db,
            services,
            cancel,
        }
    }

    /// Token for the restart step. A cancellation that arrives once the
    /// storage swap has started is logged and does not stop the restart.
    fn restart_token(&self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            warn!("Cancellation requested after data was replaced; restarting services anyway");
            CancellationToken::new()
        } else {
            self.cancel.clone()
        }
    }

    /// Restart failures and a low healthy count are reported, not fatal:
    /// the data is already restored at this point.
    async fn restart_services(&self, cancel: &CancellationToken) -> Result<(Vec<String>, usize)> {
        let units = &self.config.services.units;
        if units.is_empty() {
            info!("No services configured for restart");
            return Ok((Vec::new(), 0));
        }

        let failed = services::restart_all(&self.services, units, cancel).await?;
        let required = self.config.services.required_healthy();
        let healthy = services::wait_until_healthy(
            &self.services,
            units,
            required,
            self.config.services.health_attempts,
            self.config.services.health_interval(),
            cancel,
        )
        .await?;

        if healthy < required {
            warn!(
                "Only {}/{} services healthy (minimum {})",
                healthy,
                units.len(),
                required
            );
        }
        Ok((failed, healthy))
    }
}
