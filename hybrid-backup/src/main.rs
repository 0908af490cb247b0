//! hybrid-backup - Main entry point
//!
//! Coordinated database + storage backup, verification and restore.

use clap::{CommandFactory, Parser, Subcommand};
use hybrid_backup::daemon::ShutdownCoordinator;
use hybrid_backup::db::{PostgresBackend, PsqlAdminQueries};
use hybrid_backup::executor::{retention, SnapshotCoordinator};
use hybrid_backup::process::require_tools;
use hybrid_backup::restore::{confirm, RestoreCoordinator, RestoreOptions};
use hybrid_backup::safety::{self, SafetyNetManager};
use hybrid_backup::services::{healthy_count, SystemdServices};
use hybrid_backup::state::validator::{log_findings, permission_findings};
use hybrid_backup::state::{
    compare, default_report_path, latest_report, Report, ServiceHealth, StateSnapshot,
};
use hybrid_backup::transfer::progress::format_bytes;
use hybrid_backup::utils::{self, errors::exit};
use hybrid_backup::verify::IntegrityVerifier;
use hybrid_backup::{BackupError, Config, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the database and storage tree into one archive
    Backup {
        /// Tag recorded in the manifest
        #[arg(long = "type", default_value = "manual")]
        backup_type: String,
    },
    /// Overwrite the live database and storage from an archive
    Restore {
        archive: Option<PathBuf>,

        /// Skip the interactive confirmation
        #[arg(long)]
        force: bool,

        /// Capture a safety backup of live state first
        #[arg(long)]
        safety_net: bool,
    },
    /// Write a state snapshot report of the live system
    Snapshot { output: Option<PathBuf> },
    /// Compare a pre report against a post report or the live system
    Validate {
        pre: Option<PathBuf>,

        #[arg(long)]
        post: Option<PathBuf>,
    },
    /// Check an archive or extracted directory without touching live state
    Verify {
        path: PathBuf,

        /// Also read the dump's table of contents with pg_restore
        #[arg(long)]
        dry_run: bool,
    },
    /// List backup archives, newest first
    List,
    /// Remove all but the newest N backup archives
    Prune {
        #[arg(long)]
        keep: usize,
    },
    /// Capture a safety backup of live state
    SafetyBackup,
    /// Remove all but the newest N safety backups
    SafetyPrune {
        #[arg(long)]
        keep: usize,
    },
}

/// What a successful command reports in the final block.
struct Summary(Vec<String>);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Command::Restore { archive: None, .. } = args.command {
        let mut cmd = Args::command();
        let usage = cmd
            .find_subcommand_mut("restore")
            .map(|restore| restore.render_usage().to_string())
            .unwrap_or_default();
        eprintln!("error: restore requires an archive path\n\n{}", usage);
        return ExitCode::from(exit::USAGE);
    }

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(exit::UNCLASSIFIED);
    }

    let operation_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("op", id = %operation_id);

    let result = run(args.command, config).instrument(span).await;
    match result {
        Ok(Summary(lines)) => {
            println!("==================== SUCCESS ====================");
            for line in lines {
                println!("{}", line);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("==================== FAILURE ====================");
            println!("{}", e);
            if let BackupError::Validation(items)
            | BackupError::Integrity(items)
            | BackupError::ChecksumMismatch(items) = &e
            {
                for item in items {
                    println!("  - {}", item);
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Install the signal listener and hand out its token.
fn cancel_on_signal() -> CancellationToken {
    ShutdownCoordinator::new().listen()
}

async fn run(command: Command, config: Config) -> Result<Summary> {
    info!(
        "hybrid-backup v{} ({})",
        env!("CARGO_PKG_VERSION"),
        command_name(&command)
    );

    match command {
        Command::Backup { backup_type } => backup(config, &backup_type).await,
        Command::Restore {
            archive,
            force,
            safety_net,
        } => {
            let archive = archive.ok_or_else(|| BackupError::MissingInput("archive path".into()))?;
            restore(config, &archive, force, safety_net).await
        }
        Command::Snapshot { output } => snapshot(config, output).await,
        Command::Validate { pre, post } => validate(config, pre, post).await,
        Command::Verify { path, dry_run } => verify(config, &path, dry_run).await,
        Command::List => list(&config),
        Command::Prune { keep } => {
            let removed = retention::prune(&config.backup.dir, keep)?;
            Ok(Summary(vec![format!("Removed {} archive(s)", removed.len())]))
        }
        Command::SafetyBackup => safety_backup(config).await,
        Command::SafetyPrune { keep } => {
            let removed = safety::prune(&config.safety_dir(), keep)?;
            Ok(Summary(vec![format!("Removed {} safety backup(s)", removed.len())]))
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Backup { .. } => "backup",
        Command::Restore { .. } => "restore",
        Command::Snapshot { .. } => "snapshot",
        Command::Validate { .. } => "validate",
        Command::Verify { .. } => "verify",
        Command::List => "list",
        Command::Prune { .. } => "prune",
        Command::SafetyBackup => "safety-backup",
        Command::SafetyPrune { .. } => "safety-prune",
    }
}

async fn backup(config: Config, backup_type: &str) -> Result<Summary> {
    require_tools(&[config.database.pg_dump.as_str()])?;
    let db = PostgresBackend::new(config.database.clone(), config.timeouts.clone());

    let coordinator = SnapshotCoordinator::new(config, db, cancel_on_signal());
    let packaged = coordinator.run(backup_type).await?;

    Ok(Summary(vec![
        format!("Archive: {}", packaged.path.display()),
        format!("Size: {}", format_bytes(packaged.size)),
        format!("Files digested: {}", packaged.checksums.len()),
    ]))
}

async fn restore(config: Config, archive: &Path, force: bool, safety_net: bool) -> Result<Summary> {
    if !archive.is_file() {
        return Err(BackupError::MissingInput(format!(
            "archive {} does not exist",
            archive.display()
        )));
    }

    let mut tools = vec![
        config.database.pg_restore.as_str(),
        config.database.pg_isready.as_str(),
    ];
    if safety_net {
        tools.push(config.database.pg_dump.as_str());
    }
    require_tools(&tools)?;

    if force {
        warn!("Confirmation skipped (--force)");
    } else {
        confirm(archive, std::io::stdin().lock(), std::io::stdout())?;
    }

    let db = PostgresBackend::new(config.database.clone(), config.timeouts.clone());
    let services = SystemdServices::new(&config.services, &config.timeouts);
    let coordinator = RestoreCoordinator::new(config, db, services, cancel_on_signal());

    let outcome = coordinator
        .run(archive, RestoreOptions { safety_net })
        .await?;

    let mut lines = vec![
        format!("Restored: {}", outcome.archive.display()),
        format!(
            "Storage: {} file(s), {}",
            outcome.storage_files,
            format_bytes(outcome.storage_bytes)
        ),
        format!("Healthy services: {}", outcome.healthy_services),
    ];
    if let Some(manifest) = &outcome.manifest {
        lines.push(format!("Backup taken: {} (version {})", manifest.timestamp, manifest.version));
    }
    if let Some(backup) = &outcome.safety_backup {
        lines.push(format!("Safety backup: {}", backup.path.display()));
    }
    if !outcome.failed_services.is_empty() {
        lines.push(format!("Failed to restart: {}", outcome.failed_services.join(", ")));
    }
    Ok(Summary(lines))
}

async fn snapshot(config: Config, output: Option<PathBuf>) -> Result<Summary> {
    require_tools(&[config.database.psql.as_str()])?;
    let admin = PsqlAdminQueries::new(config.database.clone(), config.admin.clone(), &config.timeouts);
    let cancel = cancel_on_signal();

    let snapshot = StateSnapshot::capture(&admin, &config.storage.path, &cancel).await?;
    let path = output.unwrap_or_else(|| default_report_path(&config.backup.reports_dir, &snapshot.taken_at));
    snapshot.write(&path)?;

    let mut lines = vec![format!("Report: {}", path.display())];
    lines.extend(
        snapshot
            .metrics()
            .into_iter()
            .map(|(label, value)| format!("{}: {}", label, value)),
    );
    Ok(Summary(lines))
}

async fn validate(config: Config, pre: Option<PathBuf>, post: Option<PathBuf>) -> Result<Summary> {
    let pre_path = match pre {
        Some(path) => path,
        None => latest_report(&config.backup.reports_dir)?,
    };
    info!("Pre report: {}", pre_path.display());
    let pre = Report::load(&pre_path)?;
    let cancel = cancel_on_signal();

    let post = match post {
        Some(path) => Report::load(&path)?,
        None => {
            require_tools(&[config.database.psql.as_str()])?;
            let admin =
                PsqlAdminQueries::new(config.database.clone(), config.admin.clone(), &config.timeouts);
            let snapshot = StateSnapshot::capture(&admin, &config.storage.path, &cancel).await?;
            Report::parse(&snapshot.render())?
        }
    };

    let mut result = compare(&pre, &post);

    match permission_findings(&config) {
        Ok(findings) => result.soft.extend(findings),
        Err(e) => warn!("Permission audit skipped: {}", e),
    }
    result.soft.extend(log_findings(
        &config.services.log_files,
        config.services.log_scan_lines,
    ));

    let units = &config.services.units;
    if !units.is_empty() {
        let services = SystemdServices::new(&config.services, &config.timeouts);
        result.services = Some(ServiceHealth {
            healthy: healthy_count(&services, units, &cancel).await?,
            required: config.services.required_healthy(),
            total: units.len(),
        });
    }

    print!("{}", result.render());
    if result.succeeded() {
        Ok(Summary(vec![format!(
            "{} metric(s) match",
            result.metrics.len()
        )]))
    } else {
        Err(BackupError::Validation(result.failures()))
    }
}

async fn verify(config: Config, path: &Path, dry_run: bool) -> Result<Summary> {
    let db = PostgresBackend::new(config.database.clone(), config.timeouts.clone());
    if dry_run {
        require_tools(&[config.database.pg_restore.as_str()])?;
    }

    let report = IntegrityVerifier::new(&config)
        .verify(path, dry_run.then_some(&db), &cancel_on_signal())
        .await?;
    print!("{}", report.render());

    let report = report.into_result()?;
    Ok(Summary(vec![
        format!("Verified: {}", path.display()),
        format!("{} check(s) passed", report.checks.len()),
    ]))
}

fn list(config: &Config) -> Result<Summary> {
    let archives = retention::list_archives(&config.backup.dir)?;
    let mut lines = Vec::with_capacity(archives.len() + 1);
    for archive in &archives {
        lines.push(format!(
            "{}  {:>10}  {}",
            archive.name,
            format_bytes(archive.size),
            archive.modified.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    lines.push(format!("{} archive(s) in {}", archives.len(), config.backup.dir.display()));
    Ok(Summary(lines))
}

async fn safety_backup(config: Config) -> Result<Summary> {
    require_tools(&[config.database.pg_dump.as_str()])?;
    let db = PostgresBackend::new(config.database.clone(), config.timeouts.clone());

    let backup = SafetyNetManager::new(&config, &db)
        .capture(&cancel_on_signal())
        .await?;

    let mut lines = vec![format!("Safety backup: {}", backup.path.display())];
    lines.extend(backup.manifest.items.iter().map(|item| {
        format!("{}: {:?} ({})", item.name, item.status, item.detail)
    }));
    Ok(Summary(lines))
}
