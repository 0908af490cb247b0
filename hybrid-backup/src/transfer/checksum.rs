//! Per-file SHA-256 digests of a backup unit.
//!
//! The set is written as a flat `sha256sum`-compatible file inside the unit
//! at packaging time and checked again after transfer/extraction, so a
//! single flipped byte in any packaged file is detected.

use crate::utils::errors::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the digest file inside a unit.
pub const CHECKSUM_FILE: &str = "checksums.sha256";

/// Relative path → hex digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    entries: BTreeMap<String, String>,
}

impl ChecksumSet {
    /// Digest every regular file under `dir` except the digest file itself.
    pub fn generate(dir: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relative_name(dir, entry.path());
            if relative == CHECKSUM_FILE {
                continue;
            }
            entries.insert(relative, sha256_file(entry.path())?);
        }

        Ok(Self { entries })
    }

    /// Persist as `<digest>  <path>` lines into `dir/checksums.sha256`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CHECKSUM_FILE);
        fs::write(&path, self.render())?;
        Ok(path)
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(path, digest)| format!("{}  {}\n", digest, path))
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (digest, path) = line.split_once("  ").ok_or_else(|| {
                BackupError::Integrity(vec![format!(
                    "{} line {}: malformed checksum entry",
                    CHECKSUM_FILE,
                    number + 1
                )])
            })?;
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(BackupError::Integrity(vec![format!(
                    "{} line {}: invalid digest",
                    CHECKSUM_FILE,
                    number + 1
                )]));
            }
            entries.insert(path.trim_start_matches("./").to_string(), digest.to_ascii_lowercase());
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn digest(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Recompute every listed digest under `dir`; returns one line per
    /// missing or mismatching file.
    pub fn verify(&self, dir: &Path) -> Vec<String> {
        let mut problems = Vec::new();

        for (path, expected) in &self.entries {
            let full = dir.join(path);
            match sha256_file(&full) {
                Ok(actual) if &actual == expected => {}
                Ok(actual) => problems.push(format!(
                    "{}: expected {}, got {}",
                    path, expected, actual
                )),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    problems.push(format!("{}: missing", path))
                }
                Err(e) => problems.push(format!("{}: unreadable ({})", path, e)),
            }
        }

        problems
    }

    /// Like [`verify`](Self::verify) but fails with `ChecksumMismatch`.
    pub fn ensure(&self, dir: &Path) -> Result<()> {
        let problems = self.verify(dir);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BackupError::ChecksumMismatch(problems))
        }
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
