//! PostgreSQL client-tool implementation of [`DatabaseBackend`].

use super::DatabaseBackend;
use crate::config::{DatabaseConfig, TimeoutConfig};
use crate::process::{self, CommandSpec};
use crate::utils::errors::{BackupError, Result};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `pg_isready` exit codes
const READY_OK: i32 = 0;
const READY_REJECTING: i32 = 1;
const READY_NO_RESPONSE: i32 = 2;

#[derive(Debug, Clone)]
pub struct PostgresBackend {
    db: DatabaseConfig,
    timeouts: TimeoutConfig,
}

impl PostgresBackend {
    pub fn new(db: DatabaseConfig, timeouts: TimeoutConfig) -> Self {
        Self { db, timeouts }
    }

    fn command(&self, program: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(program).args([
            "-h".to_string(),
            self.db.host.clone(),
            "-p".to_string(),
            self.db.port.to_string(),
            "-U".to_string(),
            self.db.user.clone(),
        ]);
        if let Some(password) = &self.db.password {
            spec = spec.env("PGPASSWORD", password.clone());
        }
        spec
    }

    async fn run_checked(
        &self,
        spec: CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let output = process::run(&spec, timeout, cancel).await?;
        let diagnostics = output.diagnostics();
        for warning in &diagnostics.warnings {
            warn!("{}", warning);
        }
        output.check(&spec.program)?;
        Ok(())
    }
}

impl DatabaseBackend for PostgresBackend {
    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let attempts = self.db.ready_attempts.max(1);

        for attempt in 1..=attempts {
            let spec = self
                .command(&self.db.pg_isready)
                .args(["-d".to_string(), self.db.name.clone()]);
            let output = process::run(&spec, self.timeouts.query(), cancel).await?;

            match output.status.code() {
                Some(READY_OK) => {
                    info!("Database is accepting connections");
                    return Ok(());
                }
                Some(READY_REJECTING) | Some(READY_NO_RESPONSE) => {
                    debug!(
                        "Database not ready (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        output.stdout.trim()
                    );
                }
                _ => {
                    // Bad parameters will not fix themselves.
                    output.check(&self.db.pg_isready)?;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.db.ready_interval()) => {}
                    _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                }
            }
        }

        Err(BackupError::NotReady {
            what: format!("database {}:{}", self.db.host, self.db.port),
            attempts,
        })
    }

    async fn dump(&self, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let spec = self
            .command(&self.db.pg_dump)
            .args(["-d".to_string(), self.db.name.clone()])
            .args(["--format=custom", "--compress=6", "--no-password"])
            .arg("--file")
            .arg(dest.as_os_str());

        self.run_checked(spec, self.timeouts.dump(), cancel).await
    }

    async fn restore(&self, dump: &Path, cancel: &CancellationToken) -> Result<()> {
        // --if-exists keeps the clean phase from failing on objects that are
        // not present yet, so the exit status alone decides success.
        let spec = self
            .command(&self.db.pg_restore)
            .args(["-d".to_string(), self.db.name.clone()])
            .args([
                "--clean",
                "--if-exists",
                "--no-owner",
                "--no-password",
                "--single-transaction",
                "--exit-on-error",
            ])
            .arg(dump.as_os_str());

        self.run_checked(spec, self.timeouts.restore(), cancel).await
    }

    async fn dry_run(&self, dump: &Path, cancel: &CancellationToken) -> Result<()> {
        let spec = CommandSpec::new(self.db.pg_restore.clone())
            .arg("--list")
            .arg(dump.as_os_str());
        let output = process::run(&spec, self.timeouts.query(), cancel).await?;
        let output = output.check(&self.db.pg_restore)?;

        let entries = output
            .stdout
            .lines()
            .filter(|l| !l.starts_with(';') && !l.trim().is_empty())
            .count();
        debug!("Dump table of contents lists {} entries", entries);
        Ok(())
    }

    async fn export_plain(&self, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let spec = self
            .command(&self.db.pg_dump)
            .args(["-d".to_string(), self.db.name.clone()])
            .args(["--format=plain", "--no-password"])
            .arg("--file")
            .arg(dest.as_os_str());

        self.run_checked(spec, self.timeouts.dump(), cancel).await
    }
}
