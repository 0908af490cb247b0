//! Database side of a backup: logical dump, clean restore, dry-run listing
//! and the generic export used by safety backups.

pub mod admin;
pub mod postgres;

use crate::utils::errors::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub use admin::{AdminQueries, PsqlAdminQueries};
pub use postgres::PostgresBackend;

/// Operations the coordinators need from the relational store.
///
/// Implementations classify failures by the tool's exit status; stderr is
/// only used to itemise what went wrong.
#[allow(async_fn_in_trait)]
pub trait DatabaseBackend {
    /// Wait until the server accepts connections, retrying transient
    /// "not ready" answers.
    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()>;

    /// Write a self-contained compressed logical dump to `dest`.
    async fn dump(&self, dest: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Restore `dump`, dropping conflicting objects first.
    async fn restore(&self, dump: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Structural dry run: read the dump's table of contents without
    /// touching the live database.
    async fn dry_run(&self, dump: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Generic (plain SQL) export used for safety backups.
    async fn export_plain(&self, dest: &Path, cancel: &CancellationToken) -> Result<()>;
}
