mod common;

use common::{scenario_a, Env, FakeDatabase, FakeServices};
use hybrid_backup::archive;
use hybrid_backup::config::Compression;
use hybrid_backup::executor::{PackagedArchive, SnapshotCoordinator};
use hybrid_backup::fs::locate_artifact;
use hybrid_backup::restore::{RestoreCoordinator, RestoreOptions};
use hybrid_backup::utils::errors::exit;
use hybrid_backup::verify::IntegrityVerifier;
use hybrid_backup::BackupError;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

async fn packaged(env: &Env, db: &FakeDatabase) -> PackagedArchive {
    SnapshotCoordinator::new(env.config.clone(), db.clone(), CancellationToken::new())
        .run("full")
        .await
        .unwrap()
}

/// Extract an archive and return the directory holding its artifacts.
fn extract(archive_path: &Path, dest: &Path) -> PathBuf {
    archive::unpack(archive_path, dest).unwrap();
    locate_artifact(dest, "database.dump", 4)
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

fn flip_byte(path: &Path, offset: usize) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset] ^= 0x01;
    fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn test_fresh_archive_verifies() {
    let env = Env::new();
    env.fill_storage(4);
    let db = FakeDatabase::with_counts(scenario_a());
    let archive_path = packaged(&env, &db).await.path;

    let report = IntegrityVerifier::new(&env.config)
        .verify(&archive_path, Some(&db), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed(), "{}", report.render());
    let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
    assert_eq!(
        names,
        vec![
            "database dump",
            "manifest",
            "components",
            "storage archive",
            "checksums",
            "dry-run restore"
        ]
    );
    assert!(report.render().contains("[PASS] storage archive: 4 file(s)"));
    assert!(env.leftovers().is_empty());
}

#[tokio::test]
async fn test_verifier_is_idempotent() {
    let env = Env::new();
    env.fill_storage(2);
    let db = FakeDatabase::with_counts(scenario_a());
    let archive_path = packaged(&env, &db).await.path;
    let before = fs::read(&archive_path).unwrap();

    let verifier = IntegrityVerifier::new(&env.config);
    let cancel = CancellationToken::new();
    let first = verifier.verify(&archive_path, Some(&db), &cancel).await.unwrap();
    let second = verifier.verify(&archive_path, Some(&db), &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fs::read(&archive_path).unwrap(), before);
}

#[tokio::test]
async fn test_single_byte_corruption_is_detected() {
    let env = Env::new();
    env.fill_storage(2);
    let db = FakeDatabase::with_counts(scenario_a());
    let archive_path = packaged(&env, &db).await.path;

    let scratch = env.temp.path().join("transferred");
    let unit = extract(&archive_path, &scratch);
    flip_byte(&unit.join("database.dump"), 20);

    let report = IntegrityVerifier::new(&env.config)
        .verify::<FakeDatabase>(&scratch, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.passed());

    let failures = report.failures();
    assert_eq!(failures.len(), 1, "{:?}", failures);
    assert!(failures[0].starts_with("checksums: database.dump"));

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, BackupError::ChecksumMismatch(_)));
    assert_eq!(err.exit_code(), exit::CHECKSUM);
}

#[tokio::test]
async fn test_restore_refuses_corrupted_archive() {
    let env = Env::new();
    env.fill_storage(2);
    let db = FakeDatabase::with_counts(scenario_a());
    let original = packaged(&env, &db).await;

    // Corrupt one byte of the storage archive and repackage.
    let scratch = env.temp.path().join("transferred");
    let unit = extract(&original.path, &scratch);
    let storage = unit.join("storage.tar.gz");
    let len = fs::metadata(&storage).unwrap().len() as usize;
    flip_byte(&storage, len / 2);
    let corrupted = env.temp.path().join("backup_corrupted.tar.gz");
    archive::pack_dir(&unit, &corrupted, "backup_corrupted", Compression::Gzip, 6).unwrap();

    let err = RestoreCoordinator::new(
        env.config.clone(),
        db.clone(),
        FakeServices::default(),
        CancellationToken::new(),
    )
    .run(&corrupted, RestoreOptions::default())
    .await
    .unwrap_err();

    assert_eq!(err.exit_code(), exit::CHECKSUM, "{}", err);
    assert_eq!(db.restores(), 0);
    assert!(env.leftovers().is_empty());
}

#[tokio::test]
async fn test_missing_component_is_itemised() {
    let env = Env::new();
    let db = FakeDatabase::with_counts(scenario_a());
    let archive_path = packaged(&env, &db).await.path;

    let scratch = env.temp.path().join("extracted");
    let unit = extract(&archive_path, &scratch);
    fs::remove_file(unit.join("storage.tar.gz")).unwrap();

    let report = IntegrityVerifier::new(&env.config).verify_dir(&scratch);
    let failures = report.failures();
    assert!(failures.iter().any(|f| f == "components: missing: storage.tar.gz"), "{:?}", failures);
    assert!(matches!(report.into_result(), Err(BackupError::ChecksumMismatch(_))));
}

#[tokio::test]
async fn test_trivial_dump_fails_verification() {
    let env = Env::new();
    let dir = env.temp.path().join("unit");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("database.dump"), b"tiny").unwrap();

    let report = IntegrityVerifier::new(&env.config).verify_dir(&dir);
    assert!(!report.passed());
    assert!(report.failures()[0].contains("only 4 bytes"));
    assert!(report.failures().iter().any(|f| f.starts_with("manifest:")));
}

#[tokio::test]
async fn test_garbage_file_is_reported_not_raised() {
    let env = Env::new();
    let garbage = env.temp.path().join("garbage.tar.gz");
    fs::write(&garbage, b"not an archive at all").unwrap();

    let report = IntegrityVerifier::new(&env.config)
        .verify::<FakeDatabase>(&garbage, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.passed());
    assert_eq!(report.checks[0].name, "archive");
}
