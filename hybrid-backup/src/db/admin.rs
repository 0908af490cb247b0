//! Administrative Query Interface: entity counts used by state snapshots.

use crate::config::{AdminConfig, DatabaseConfig, TimeoutConfig};
use crate::process::{self, CommandSpec};
use crate::utils::errors::{BackupError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts of the application's domain entities.
#[allow(async_fn_in_trait)]
pub trait AdminQueries {
    async fn count_documents(&self, cancel: &CancellationToken) -> Result<u64>;
    async fn count_users(&self, cancel: &CancellationToken) -> Result<u64>;
    async fn count_files(&self, cancel: &CancellationToken) -> Result<u64>;
    async fn count_versions(&self, cancel: &CancellationToken) -> Result<u64>;
    async fn count_workflow_instances(&self, cancel: &CancellationToken) -> Result<u64>;
}

/// Runs the configured count queries through `psql`.
#[derive(Debug, Clone)]
pub struct PsqlAdminQueries {
    db: DatabaseConfig,
    queries: AdminConfig,
    timeout: Duration,
}

impl PsqlAdminQueries {
    pub fn new(db: DatabaseConfig, queries: AdminConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            db,
            queries,
            timeout: timeouts.query(),
        }
    }

    async fn count(&self, sql: &str, cancel: &CancellationToken) -> Result<u64> {
        let mut spec = CommandSpec::new(self.db.psql.clone()).args([
            "-h".to_string(),
            self.db.host.clone(),
            "-p".to_string(),
            self.db.port.to_string(),
            "-U".to_string(),
            self.db.user.clone(),
            "-d".to_string(),
            self.db.name.clone(),
            "--no-password".to_string(),
            "--no-psqlrc".to_string(),
            "--tuples-only".to_string(),
            "--no-align".to_string(),
            "--set=ON_ERROR_STOP=1".to_string(),
            "--command".to_string(),
            sql.to_string(),
        ]);
        if let Some(password) = &self.db.password {
            spec = spec.env("PGPASSWORD", password.clone());
        }

        let output = process::run(&spec, self.timeout, cancel)
            .await?
            .check(&self.db.psql)?;
        parse_count(&output.stdout, sql)
    }
}

fn parse_count(stdout: &str, sql: &str) -> Result<u64> {
    let value = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();

    value.parse::<u64>().map_err(|_| BackupError::ProcessFailed {
        program: "psql".to_string(),
        status: "unexpected output".to_string(),
        detail: format!("{:?} returned {:?}", sql, value),
    })
}

impl AdminQueries for PsqlAdminQueries {
    async fn count_documents(&self, cancel: &CancellationToken) -> Result<u64> {
        self.count(&self.queries.documents_query, cancel).await
    }

    async fn count_users(&self, cancel: &CancellationToken) -> Result<u64> {
        self.count(&self.queries.users_query, cancel).await
    }

    async fn count_files(&self, cancel: &CancellationToken) -> Result<u64> {
        self.count(&self.queries.files_query, cancel).await
    }

    async fn count_versions(&self, cancel: &CancellationToken) -> Result<u64> {
        self.count(&self.queries.versions_query, cancel).await
    }

    async fn count_workflow_instances(&self, cancel: &CancellationToken) -> Result<u64> {
        self.count(&self.queries.workflow_instances_query, cancel).await
    }
}
