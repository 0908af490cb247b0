//! Error types for backup, verification and restore.
//!
//! Every variant maps to a distinct process exit code so that calling
//! automation can branch on the failure class.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit codes returned by the binary.
pub mod exit {
    pub const SUCCESS: u8 = 0;
    pub const UNCLASSIFIED: u8 = 1;
    pub const USAGE: u8 = 2;
    pub const CONFIG: u8 = 3;
    pub const LOCK_HELD: u8 = 4;
    pub const MISSING_TOOL: u8 = 5;
    pub const MISSING_INPUT: u8 = 6;
    pub const BACKUP_DATABASE: u8 = 10;
    pub const BACKUP_STORAGE: u8 = 11;
    pub const BACKUP_MANIFEST: u8 = 12;
    pub const BACKUP_PACKAGE: u8 = 13;
    pub const RESTORE_EXTRACT: u8 = 20;
    pub const RESTORE_DATABASE: u8 = 21;
    pub const RESTORE_STORAGE: u8 = 22;
    pub const ABORTED: u8 = 23;
    pub const VALIDATION: u8 = 30;
    pub const INTEGRITY: u8 = 31;
    pub const CHECKSUM: u8 = 32;
    pub const SAFETY_NET: u8 = 40;
    pub const TIMEOUT: u8 = 124;
    pub const CANCELLED: u8 = 130;
}

/// A numbered step of a multi-step operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    BackupDatabase,
    BackupStorage,
    BackupManifest,
    BackupPackage,
    RestoreExtract,
    RestoreDatabase,
    RestoreStorage,
    RestoreServices,
    RestoreCleanup,
}

impl Stage {
    /// Label printed before the stage runs, e.g. `Step 1/4: Backing up database`.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::BackupDatabase => "Step 1/4: Backing up database",
            Stage::BackupStorage => "Step 2/4: Archiving storage",
            Stage::BackupManifest => "Step 3/4: Writing manifest",
            Stage::BackupPackage => "Step 4/4: Packaging archive",
            Stage::RestoreExtract => "Step 1/5: Extracting archive",
            Stage::RestoreDatabase => "Step 2/5: Restoring database",
            Stage::RestoreStorage => "Step 3/5: Restoring storage",
            Stage::RestoreServices => "Step 4/5: Restarting services",
            Stage::RestoreCleanup => "Step 5/5: Cleaning up",
        }
    }

    fn exit_code(&self) -> u8 {
        match self {
            Stage::BackupDatabase => exit::BACKUP_DATABASE,
            Stage::BackupStorage => exit::BACKUP_STORAGE,
            Stage::BackupManifest => exit::BACKUP_MANIFEST,
            Stage::BackupPackage => exit::BACKUP_PACKAGE,
            Stage::RestoreExtract => exit::RESTORE_EXTRACT,
            Stage::RestoreDatabase => exit::RESTORE_DATABASE,
            Stage::RestoreStorage | Stage::RestoreServices | Stage::RestoreCleanup => {
                exit::RESTORE_STORAGE
            }
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Required tool not found: {0}")]
    MissingTool(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("{name} not found in {}", .root.display())]
    ArtifactNotFound { name: String, root: PathBuf },

    #[error("{program} exited with {status}: {detail}")]
    ProcessFailed {
        program: String,
        status: String,
        detail: String,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Another backup or restore holds the lock at {}", .0.display())]
    LockHeld(PathBuf),

    #[error("Checksum mismatch: {}", .0.join("; "))]
    ChecksumMismatch(Vec<String>),

    #[error("Integrity check failed: {}", .0.join("; "))]
    Integrity(Vec<String>),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Empty artifact: {}", .0.display())]
    EmptyArtifact(PathBuf),

    #[error("Storage restore failed and live storage was rolled back: {0}")]
    StorageRolledBack(String),

    #[error(
        "Storage rollback failed ({reason}); previous storage kept at {}",
        .kept.display()
    )]
    StorageRollbackFailed { kept: PathBuf, reason: String },

    #[error("Safety backup failed: {0}")]
    SafetyNet(String),

    #[error("Restore aborted by operator")]
    Aborted,

    #[error("Not ready after {attempts} attempts: {what}")]
    NotReady { what: String, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl BackupError {
    /// Wrap an error with the stage it occurred in.
    pub fn at(stage: Stage, err: BackupError) -> Self {
        match err {
            // Cancellation and lock contention keep their own identity.
            BackupError::Cancelled | BackupError::LockHeld(_) => err,
            other => BackupError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was raised in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BackupError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Stage { stage, source } => match source.as_ref() {
                // Causes with a more specific class win over the stage code.
                BackupError::Timeout { .. }
                | BackupError::MissingTool(_)
                | BackupError::ChecksumMismatch(_)
                | BackupError::StorageRolledBack(_)
                | BackupError::StorageRollbackFailed { .. } => source.exit_code(),
                _ => stage.exit_code(),
            },
            BackupError::Config(_) => exit::CONFIG,
            BackupError::MissingTool(_) => exit::MISSING_TOOL,
            BackupError::MissingInput(_) => exit::MISSING_INPUT,
            BackupError::ArtifactNotFound { .. } => exit::RESTORE_EXTRACT,
            BackupError::Timeout { .. } => exit::TIMEOUT,
            BackupError::Cancelled => exit::CANCELLED,
            BackupError::LockHeld(_) => exit::LOCK_HELD,
            BackupError::ChecksumMismatch(_) => exit::CHECKSUM,
            BackupError::Integrity(_) | BackupError::EmptyArtifact(_) => exit::INTEGRITY,
            BackupError::Validation(_) => exit::VALIDATION,
            BackupError::StorageRolledBack(_) | BackupError::StorageRollbackFailed { .. } => {
                exit::RESTORE_STORAGE
            }
            BackupError::SafetyNet(_) => exit::SAFETY_NET,
            BackupError::Aborted => exit::ABORTED,
            BackupError::ProcessFailed { .. }
            | BackupError::NotReady { .. }
            | BackupError::Io(_)
            | BackupError::Serialization(_)
            | BackupError::Walk(_) => exit::UNCLASSIFIED,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
