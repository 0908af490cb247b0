//! Manifest describing a backup unit's contents and provenance.
//!
//! Serialized as `manifest.json` at the root of every unit. It is written
//! once with `create_new` and never rewritten.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATABASE_FILE: &str = "database.dump";
pub const STORAGE_FILE: &str = "storage.tar.gz";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// ISO-8601 creation time
    pub timestamp: String,
    /// Database dump artifact name
    pub database: String,
    /// Storage archive artifact name
    pub storage: String,
    /// Application version, or "unknown"
    pub version: String,
    pub backup_type: String,
    pub created_by: String,
}

impl Manifest {
    pub fn new(
        timestamp: DateTime<Local>,
        version: impl Into<String>,
        backup_type: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            database: DATABASE_FILE.to_string(),
            storage: STORAGE_FILE.to_string(),
            version: version.into(),
            backup_type: backup_type.into(),
            created_by: created_by.into(),
        }
    }

    /// Write `manifest.json` into `dir`; fails if one already exists.
    pub fn write_new(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        if manifest.database.is_empty() || manifest.storage.is_empty() {
            return Err(BackupError::Integrity(vec![format!(
                "{} declares no database or storage artifact",
                path.display()
            )]));
        }
        Ok(manifest)
    }

    /// Component files this manifest declares.
    pub fn components(&self) -> [&str; 2] {
        [self.database.as_str(), self.storage.as_str()]
    }
}

/// `user@host` of the process creating the backup.
pub fn default_creator() -> String {
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        let ts = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        Manifest::new(ts, "4.2.0", "full", "backup@host")
    }

    #[test]
    fn test_manifest_fields() {
        let manifest = sample();
        assert!(manifest.timestamp.starts_with("2024-03-01T12:30:05"));
        assert_eq!(manifest.components(), ["database.dump", "storage.tar.gz"]);
        assert_eq!(manifest.version, "4.2.0");
    }

    #[test]
    fn test_manifest_is_write_once() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = sample();
        let path = manifest.write_new(dir.path())?;
        assert_eq!(Manifest::load(&path)?, manifest);

        assert!(manifest.write_new(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_manifest_json_shape() -> Result<()> {
        let value = serde_json::to_value(sample())?;
        for key in ["timestamp", "database", "storage", "version", "backup_type", "created_by"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        Ok(())
    }

    #[test]
    fn test_malformed_manifest_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, "{ not json")?;
        assert!(matches!(
            Manifest::load(&path),
            Err(BackupError::Serialization(_))
        ));
        Ok(())
    }

    #[test]
    fn test_default_creator_has_user_and_host() {
        let creator = default_creator();
        assert!(creator.contains('@'));
    }
}
