//! In-memory stand-ins for the database, its admin queries and the service
//! manager, sharing one "live" state so a backup/restore round trip can be
//! observed end to end.

#![allow(dead_code)]

use hybrid_backup::db::{AdminQueries, DatabaseBackend};
use hybrid_backup::services::ServiceManager;
use hybrid_backup::{BackupError, Config, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DUMP_HEADER: &str = "FAKE-PGDMP";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub documents: u64,
    pub users: u64,
    pub files: u64,
    pub versions: u64,
    pub workflow_instances: u64,
}

#[derive(Debug, Default)]
struct State {
    counts: Counts,
    restores: u32,
    fail_dump: bool,
    fail_restore: bool,
}

/// Database whose "tables" are five counters.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    pub fn with_counts(counts: Counts) -> Self {
        let db = Self::default();
        db.set_counts(counts);
        db
    }

    pub fn counts(&self) -> Counts {
        self.state.lock().unwrap().counts
    }

    pub fn set_counts(&self, counts: Counts) {
        self.state.lock().unwrap().counts = counts;
    }

    pub fn restores(&self) -> u32 {
        self.state.lock().unwrap().restores
    }

    pub fn fail_dump(&self) {
        self.state.lock().unwrap().fail_dump = true;
    }

    pub fn fail_restore(&self) {
        self.state.lock().unwrap().fail_restore = true;
    }

    fn read_dump(dump: &Path) -> Result<Counts> {
        let content = std::fs::read_to_string(dump)?;
        let mut lines = content.lines();
        if lines.next() != Some(DUMP_HEADER) {
            return Err(BackupError::ProcessFailed {
                program: "pg_restore".into(),
                status: "exit status: 1".into(),
                detail: "input file does not appear to be a valid archive".into(),
            });
        }
        Ok(serde_json::from_str(lines.next().unwrap_or_default())?)
    }
}

impl DatabaseBackend for FakeDatabase {
    async fn wait_ready(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn dump(&self, dest: &Path, _cancel: &CancellationToken) -> Result<()> {
        if self.state.lock().unwrap().fail_dump {
            return Err(BackupError::ProcessFailed {
                program: "pg_dump".into(),
                status: "exit status: 1".into(),
                detail: "connection to server failed".into(),
            });
        }
        let counts = serde_json::to_string(&self.counts())?;
        // Padding keeps the dump above the "non-trivial size" threshold.
        std::fs::write(dest, format!("{}\n{}\n{}\n", DUMP_HEADER, counts, "#".repeat(128)))?;
        Ok(())
    }

    async fn restore(&self, dump: &Path, _cancel: &CancellationToken) -> Result<()> {
        if self.state.lock().unwrap().fail_restore {
            return Err(BackupError::ProcessFailed {
                program: "pg_restore".into(),
                status: "exit status: 1".into(),
                detail: "could not connect".into(),
            });
        }
        let counts = Self::read_dump(dump)?;
        let mut state = self.state.lock().unwrap();
        state.counts = counts;
        state.restores += 1;
        Ok(())
    }

    async fn dry_run(&self, dump: &Path, _cancel: &CancellationToken) -> Result<()> {
        Self::read_dump(dump).map(|_| ())
    }

    async fn export_plain(&self, dest: &Path, _cancel: &CancellationToken) -> Result<()> {
        let counts = self.counts();
        std::fs::write(dest, format!("-- plain export\n-- documents={}\n", counts.documents))?;
        Ok(())
    }
}

impl AdminQueries for FakeDatabase {
    async fn count_documents(&self, _cancel: &CancellationToken) -> Result<u64> {
        Ok(self.counts().documents)
    }

    async fn count_users(&self, _cancel: &CancellationToken) -> Result<u64> {
        Ok(self.counts().users)
    }

    async fn count_files(&self, _cancel: &CancellationToken) -> Result<u64> {
        Ok(self.counts().files)
    }

    async fn count_versions(&self, _cancel: &CancellationToken) -> Result<u64> {
        Ok(self.counts().versions)
    }

    async fn count_workflow_instances(&self, _cancel: &CancellationToken) -> Result<u64> {
        Ok(self.counts().workflow_instances)
    }
}

/// Every unit restarts and reports healthy.
#[derive(Debug, Clone, Default)]
pub struct FakeServices {
    restarted: Arc<Mutex<Vec<String>>>,
}

impl FakeServices {
    pub fn restarted(&self) -> Vec<String> {
        self.restarted.lock().unwrap().clone()
    }
}

impl ServiceManager for FakeServices {
    async fn restart(&self, unit: &str, _cancel: &CancellationToken) -> Result<()> {
        self.restarted.lock().unwrap().push(unit.to_string());
        Ok(())
    }

    async fn is_healthy(&self, _unit: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }
}

/// Scratch layout: `<tmp>/backups`, `<tmp>/storage`, `<tmp>/reports`.
pub struct Env {
    pub temp: TempDir,
    pub config: Config,
}

impl Env {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.backup.dir = temp.path().join("backups");
        config.backup.reports_dir = temp.path().join("reports");
        config.storage.path = temp.path().join("storage");
        config.services.units = vec!["app".into(), "worker".into()];
        config.services.health_interval_secs = 0;
        config.timeouts.lock_wait_secs = 1;
        Self { temp, config }
    }

    pub fn storage(&self) -> &Path {
        &self.config.storage.path
    }

    pub fn backups(&self) -> &Path {
        &self.config.backup.dir
    }

    /// Populate the storage tree with `n` files spread over two folders.
    pub fn fill_storage(&self, n: usize) {
        for i in 0..n {
            let dir = self.storage().join(if i % 2 == 0 { "invoices" } else { "contracts/2024" });
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(format!("doc_{}.pdf", i)), vec![b'x'; 100 + i]).unwrap();
        }
    }

    /// Hidden temporary trees left behind in the backup directory.
    pub fn leftovers(&self) -> Vec<PathBuf> {
        if !self.backups().exists() {
            return Vec::new();
        }
        std::fs::read_dir(self.backups())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                let name = p.file_name().unwrap().to_string_lossy().into_owned();
                p.is_dir() && name.starts_with('.')
            })
            .collect()
    }
}

pub fn scenario_a() -> Counts {
    Counts {
        documents: 5,
        users: 3,
        files: 12,
        versions: 8,
        workflow_instances: 2,
    }
}
