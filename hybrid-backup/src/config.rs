//! Configuration management for the backup tool.
//!
//! Configuration is resolved exactly once at process start from built-in
//! defaults, an optional TOML file and `HYBRID_BACKUP_*` environment
//! variables (`__` separates sections, e.g. `HYBRID_BACKUP_DATABASE__HOST`).
//! The resulting [`Config`] is cloned into every component, so nothing
//! observes an environment change mid-run.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "HYBRID_BACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub app: AppConfig,
    pub services: ServicesConfig,
    pub admin: AdminConfig,
    pub timeouts: TimeoutConfig,
    pub verify: VerifyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub name: String,

    /// Passed to child processes as `PGPASSWORD`
    pub password: Option<String>,

    pub pg_dump: String,
    pub pg_restore: String,
    pub psql: String,
    pub pg_isready: String,

    /// Readiness polling before a restore
    pub ready_attempts: u32,
    pub ready_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the uploaded-content tree
    pub path: PathBuf,

    /// Media tree captured by safety backups (optional)
    pub media_path: Option<PathBuf>,

    /// Expected owner of restored storage files
    pub owner: Option<String>,

    /// Allowed permission bits (octal strings such as "644")
    pub allowed_modes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Flat directory holding one archive per backup
    pub dir: PathBuf,

    /// Where temporary trees are created (defaults to `dir`)
    pub work_dir: Option<PathBuf>,

    /// Outer archive compression: "gzip" or "zstd"
    pub compression: Compression,

    /// Compression level (1-9 for gzip, 1-22 for zstd)
    pub compression_level: u32,

    /// Retain at most this many archives after each backup
    pub keep: Option<usize>,

    /// State snapshot reports
    pub reports_dir: PathBuf,

    /// Bounded depth when locating artifacts inside an extracted archive
    pub search_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => "tar.gz",
            Compression::Zstd => "tar.zst",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit application version
    pub version: Option<String>,

    /// File containing the application version
    pub version_file: Option<PathBuf>,

    /// Active configuration file captured by safety backups
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// systemd units restarted after a restore
    pub units: Vec<String>,

    /// Minimum number of active units (defaults to all of them)
    pub min_healthy: Option<usize>,

    pub systemctl: String,
    pub health_attempts: u32,
    pub health_interval_secs: u64,

    /// Application logs scanned for error lines during validation
    pub log_files: Vec<PathBuf>,
    pub log_scan_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub documents_query: String,
    pub users_query: String,
    pub files_query: String,
    pub versions_query: String,
    pub workflow_instances_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub dump_secs: u64,
    pub restore_secs: u64,
    pub query_secs: u64,
    pub service_secs: u64,
    pub lock_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Dumps smaller than this are treated as trivially empty
    pub min_dump_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            name: "app".to_string(),
            password: None,
            pg_dump: "pg_dump".to_string(),
            pg_restore: "pg_restore".to_string(),
            psql: "psql".to_string(),
            pg_isready: "pg_isready".to_string(),
            ready_attempts: 30,
            ready_interval_secs: 2,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/app/storage"),
            media_path: None,
            owner: None,
            allowed_modes: ["644", "664", "600", "640", "755", "775", "750", "700"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/backups/app"),
            work_dir: None,
            compression: Compression::Gzip,
            compression_level: 6,
            keep: None,
            reports_dir: PathBuf::from("/var/backups/app/reports"),
            search_depth: 4,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            min_healthy: None,
            systemctl: "systemctl".to_string(),
            health_attempts: 30,
            health_interval_secs: 2,
            log_files: Vec::new(),
            log_scan_lines: 500,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            documents_query: "SELECT count(*) FROM documents".to_string(),
            users_query: "SELECT count(*) FROM users".to_string(),
            files_query: "SELECT count(*) FROM files".to_string(),
            versions_query: "SELECT count(*) FROM document_versions".to_string(),
            workflow_instances_query: "SELECT count(*) FROM workflow_instances".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dump_secs: 3600,
            restore_secs: 3600,
            query_secs: 60,
            service_secs: 120,
            lock_wait_secs: 10,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self { min_dump_bytes: 64 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Resolve configuration from defaults, an optional TOML file and the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(BackupError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("services.units")
                .with_list_parse_key("services.log_files")
                .with_list_parse_key("storage.allowed_modes"),
        );

        let mut config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BackupError::Config(e.to_string()))?;

        config.validate()?;
        config.resolve_version();
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.backup.dir.as_os_str().is_empty() {
            return Err(BackupError::Config("backup.dir must not be empty".into()));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(BackupError::Config("storage.path must not be empty".into()));
        }
        self.storage.allowed_mode_bits()?;
        Ok(())
    }

    /// Directory under which temporary trees are created.
    pub fn work_dir(&self) -> &Path {
        self.backup.work_dir.as_deref().unwrap_or(&self.backup.dir)
    }

    /// Safety backups live in their own subdirectory of the backup dir.
    pub fn safety_dir(&self) -> PathBuf {
        self.backup.dir.join("safety")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.backup.dir.join(".hybrid-backup.lock")
    }

    /// Pin the application version: explicit value, then the trimmed
    /// contents of the version file.
    fn resolve_version(&mut self) {
        if self.app.version.as_ref().is_some_and(|v| !v.trim().is_empty()) {
            return;
        }

        self.app.version = self
            .app
            .version_file
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|content| content.trim().to_string())
            .filter(|v| !v.is_empty());
    }

    /// Application version resolved at load time, or "unknown".
    pub fn app_version(&self) -> String {
        self.app
            .version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("unknown")
            .to_string()
    }
}

impl StorageConfig {
    /// Parse the octal permission allow-list.
    pub fn allowed_mode_bits(&self) -> Result<Vec<u32>> {
        self.allowed_modes
            .iter()
            .map(|mode| {
                u32::from_str_radix(mode.trim_start_matches("0o"), 8).map_err(|_| {
                    BackupError::Config(format!("invalid permission mode: {}", mode))
                })
            })
            .collect()
    }
}

impl DatabaseConfig {
    pub fn ready_interval(&self) -> Duration {
        Duration::from_secs(self.ready_interval_secs)
    }
}

impl ServicesConfig {
    /// Number of units that must be active for the system to count as healthy.
    pub fn required_healthy(&self) -> usize {
        self.min_healthy.unwrap_or(self.units.len())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl TimeoutConfig {
    pub fn dump(&self) -> Duration {
        Duration::from_secs(self.dump_secs)
    }

    pub fn restore(&self) -> Duration {
        Duration::from_secs(self.restore_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn service(&self) -> Duration {
        Duration::from_secs(self.service_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}
