//! Safety-Net Manager: precautionary copy of live state before a
//! destructive restore.
//!
//! Layout under `<backup_dir>/safety/`:
//!
//! ```text
//! <version>_<YYYYMMDD_HHMMSS>/
//!     database.sql        plain export (required)
//!     media/              copy of the media tree (optional)
//!     storage/            copy of the storage tree (optional)
//!     <config file name>  active configuration (optional)
//!     manifest.json       what was captured and what was skipped
//! LATEST                  name of the most recent safety backup
//! ```
//!
//! A capture is assembled in a hidden partial directory and renamed into
//! place only once the database export succeeded.

use crate::config::Config;
use crate::db::DatabaseBackend;
use crate::executor::blocking;
use crate::fs::walker::copy_tree;
use crate::utils::errors::{BackupError, Result};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const LATEST_FILE: &str = "LATEST";
pub const SAFETY_MANIFEST: &str = "manifest.json";
pub const DATABASE_EXPORT: &str = "database.sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Captured,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyItem {
    pub name: String,
    pub status: ItemStatus,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyManifest {
    pub timestamp: String,
    pub version: String,
    pub items: Vec<SafetyItem>,
}

impl SafetyManifest {
    pub fn item(&self, name: &str) -> Option<&SafetyItem> {
        self.items.iter().find(|i| i.name == name)
    }
}

/// A completed safety backup on disk.
#[derive(Debug, Clone)]
pub struct SafetyBackup {
    pub path: PathBuf,
    pub manifest: SafetyManifest,
}

pub struct SafetyNetManager<'a, D> {
    config: &'a Config,
    db: &'a D,
}

impl<'a, D: DatabaseBackend> SafetyNetManager<'a, D> {
    pub fn new(config: &'a Config, db: &'a D) -> Self {
        Self { config, db }
    }

    /// Capture a safety backup. Only the database export is mandatory;
    /// missing optional trees are recorded as skipped.
    pub async fn capture(&self, cancel: &CancellationToken) -> Result<SafetyBackup> {
        let safety_dir = self.config.safety_dir();
        fs::create_dir_all(&safety_dir)?;

        let now = Local::now();
        let version = self.config.app_version();
        let name = format!("{}_{}", sanitize(&version), now.format("%Y%m%d_%H%M%S"));
        info!("Capturing safety backup {}", name);

        let partial = tempfile::Builder::new()
            .prefix(&format!(".partial-{}-", name))
            .tempdir_in(&safety_dir)?;

        let mut items = Vec::new();

        let export = partial.path().join(DATABASE_EXPORT);
        match self.db.export_plain(&export, cancel).await {
            Ok(()) => items.push(captured(DATABASE_EXPORT, "plain SQL export")),
            Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
            Err(e) => return Err(BackupError::SafetyNet(format!("database export: {}", e))),
        }

        items.push(
            self.copy_optional("media", self.config.storage.media_path.as_deref(), partial.path())
                .await?,
        );
        items.push(
            self.copy_optional("storage", Some(self.config.storage.path.as_path()), partial.path())
                .await?,
        );
        items.push(self.copy_config(partial.path())?);

        let manifest = SafetyManifest {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, false),
            version,
            items,
        };
        let content = serde_json::to_string_pretty(&manifest)?;
        fs::write(partial.path().join(SAFETY_MANIFEST), content + "\n")?;

        let final_path = unique_path(&safety_dir, &name);
        let staged = partial.keep();
        if let Err(e) = fs::rename(&staged, &final_path) {
            let _ = fs::remove_dir_all(&staged);
            return Err(BackupError::SafetyNet(format!(
                "cannot move safety backup into place: {}",
                e
            )));
        }

        let dir_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(name);
        fs::write(safety_dir.join(LATEST_FILE), format!("{}\n", dir_name))?;

        info!("Safety backup written to {}", final_path.display());
        Ok(SafetyBackup {
            path: final_path,
            manifest,
        })
    }

    async fn copy_optional(
        &self,
        name: &str,
        source: Option<&Path>,
        dest_root: &Path,
    ) -> Result<SafetyItem> {
        let Some(source) = source else {
            warn!("No {} directory configured, skipping", name);
            return Ok(skipped(name, "not configured"));
        };
        if !source.is_dir() {
            warn!("{} directory {} does not exist, skipping", name, source.display());
            return Ok(skipped(name, format!("{} does not exist", source.display())));
        }

        let src = source.to_path_buf();
        let dest = dest_root.join(name);
        let copied = blocking(move || copy_tree(&src, &dest))
            .await
            .map_err(|e| BackupError::SafetyNet(format!("copying {}: {}", name, e)))?;
        info!("Copied {} ({} files)", name, copied);
        Ok(captured(name, format!("{} file(s) from {}", copied, source.display())))
    }

    fn copy_config(&self, dest_root: &Path) -> Result<SafetyItem> {
        let Some(config_file) = self.config.app.config_file.as_deref() else {
            warn!("No config file configured, skipping");
            return Ok(skipped("config", "not configured"));
        };
        let Some(file_name) = config_file.file_name().filter(|_| config_file.is_file()) else {
            warn!("Config file {} not found, skipping", config_file.display());
            return Ok(skipped("config", format!("{} does not exist", config_file.display())));
        };

        fs::copy(config_file, dest_root.join(file_name))
            .map_err(|e| BackupError::SafetyNet(format!("copying config: {}", e)))?;
        Ok(captured("config", config_file.display().to_string()))
    }
}

fn captured(name: &str, detail: impl Into<String>) -> SafetyItem {
    SafetyItem {
        name: name.to_string(),
        status: ItemStatus::Captured,
        detail: detail.into(),
    }
}

fn skipped(name: &str, detail: impl Into<String>) -> SafetyItem {
    SafetyItem {
        name: name.to_string(),
        status: ItemStatus::Skipped,
        detail: detail.into(),
    }
}

fn sanitize(version: &str) -> String {
    version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '-' })
        .collect()
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.join(name);
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}", name, n));
        n += 1;
    }
    path
}

/// Safety backups in `dir`, newest first.
pub fn list_safety_backups(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir()
            || entry.file_name().to_string_lossy().starts_with('.')
            || !path.join(SAFETY_MANIFEST).is_file()
        {
            continue;
        }
        backups.push((entry.metadata()?.modified()?, path));
    }

    backups.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(backups.into_iter().map(|(_, p)| p).collect())
}

/// Directory the `LATEST` pointer refers to, if any.
pub fn latest_safety_backup(dir: &Path) -> Option<PathBuf> {
    let name = fs::read_to_string(dir.join(LATEST_FILE)).ok()?;
    let path = dir.join(name.trim());
    path.is_dir().then_some(path)
}

/// Remove all but the newest `keep` safety backups. The backup named by
/// `LATEST` is never removed.
pub fn prune(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let latest = latest_safety_backup(dir);
    let mut removed = Vec::new();

    for old in list_safety_backups(dir)?.into_iter().skip(keep) {
        if latest.as_ref() == Some(&old) {
            continue;
        }
        fs::remove_dir_all(&old)?;
        info!("Removed safety backup: {}", old.display());
        removed.push(old);
    }

    Ok(removed)
}
