//! Advisory exclusive lock serialising backups and restores.
//!
//! The lock is an `flock` on a well-known file in the backup directory. It
//! is released when the guard is dropped, which covers error returns and
//! cancelled futures alike.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Held lock; dropping it releases the lock.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl OperationLock {
    /// Acquire the lock, polling until `wait` expires.
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let deadline = Instant::now() + wait;
        loop {
            match Self::try_acquire(path)? {
                Some(lock) => {
                    info!("Acquired operation lock: {}", path.display());
                    return Ok(lock);
                }
                None if Instant::now() >= deadline => {
                    return Err(BackupError::LockHeld(path.to_path_buf()));
                }
                None => {
                    debug!("Lock busy, retrying: {}", path.display());
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Single non-blocking attempt. `Ok(None)` means another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut locked) => {
                // Record the holder for operators inspecting a stuck lock.
                locked.set_len(0)?;
                writeln!(&mut *locked, "{}", std::process::id())?;
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    _file: locked,
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(BackupError::Io(std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        debug!("Released operation lock: {}", self.path.display());
    }
}
