//! Application service control: restarts after a restore and health counts.

use crate::config::{ServicesConfig, TimeoutConfig};
use crate::process::{self, CommandSpec};
use crate::utils::errors::{BackupError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Control surface for the processes that cache DB connections and file
/// handles.
#[allow(async_fn_in_trait)]
pub trait ServiceManager {
    async fn restart(&self, unit: &str, cancel: &CancellationToken) -> Result<()>;
    async fn is_healthy(&self, unit: &str, cancel: &CancellationToken) -> Result<bool>;
}

/// systemd-backed implementation.
#[derive(Debug, Clone)]
pub struct SystemdServices {
    systemctl: String,
    timeout: Duration,
}

impl SystemdServices {
    pub fn new(config: &ServicesConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            systemctl: config.systemctl.clone(),
            timeout: timeouts.service(),
        }
    }
}

impl ServiceManager for SystemdServices {
    async fn restart(&self, unit: &str, cancel: &CancellationToken) -> Result<()> {
        let spec = CommandSpec::new(self.systemctl.clone()).args(["restart", unit]);
        process::run(&spec, self.timeout, cancel)
            .await?
            .check(&self.systemctl)?;
        Ok(())
    }

    async fn is_healthy(&self, unit: &str, cancel: &CancellationToken) -> Result<bool> {
        let spec = CommandSpec::new(self.systemctl.clone()).args(["is-active", "--quiet", unit]);
        let output = process::run(&spec, self.timeout, cancel).await?;
        Ok(output.success())
    }
}

/// Restart every unit; returns the units that failed to restart.
pub async fn restart_all<S: ServiceManager>(
    manager: &S,
    units: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut failed = Vec::new();

    for unit in units {
        info!("Restarting service: {}", unit);
        match manager.restart(unit, cancel).await {
            Ok(()) => info!("Restarted service: {}", unit),
            Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
            Err(e) => {
                warn!("Failed to restart {}: {}", unit, e);
                failed.push(unit.clone());
            }
        }
    }

    Ok(failed)
}

/// Count units that are currently active.
pub async fn healthy_count<S: ServiceManager>(
    manager: &S,
    units: &[String],
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut healthy = 0;
    for unit in units {
        match manager.is_healthy(unit, cancel).await {
            Ok(true) => healthy += 1,
            Ok(false) => debug!("Service not active: {}", unit),
            Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
            Err(e) => warn!("Health check for {} failed: {}", unit, e),
        }
    }
    Ok(healthy)
}

/// Poll until at least `required` units are active or attempts run out.
/// Returns the last observed healthy count.
pub async fn wait_until_healthy<S: ServiceManager>(
    manager: &S,
    units: &[String],
    required: usize,
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<usize> {
    let attempts = attempts.max(1);
    let mut healthy = 0;

    for attempt in 1..=attempts {
        healthy = healthy_count(manager, units, cancel).await?;
        if healthy >= required {
            info!("{}/{} services healthy", healthy, units.len());
            return Ok(healthy);
        }

        debug!(
            "{}/{} services healthy, need {} (attempt {}/{})",
            healthy,
            units.len(),
            required,
            attempt,
            attempts
        );

        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            }
        }
    }

    Ok(healthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Units become active after a number of health checks.
    struct SlowStart {
        checks_until_up: u32,
        checks: AtomicU32,
        broken: HashSet<String>,
        restarted: Mutex<Vec<String>>,
    }

    impl ServiceManager for SlowStart {
        async fn restart(&self, unit: &str, _cancel: &CancellationToken) -> Result<()> {
            if self.broken.contains(unit) {
                return Err(BackupError::ProcessFailed {
                    program: "systemctl".into(),
                    status: "exit code 5".into(),
                    detail: "unit not found".into(),
                });
            }
            self.restarted.lock().unwrap().push(unit.to_string());
            Ok(())
        }

        async fn is_healthy(&self, _unit: &str, _cancel: &CancellationToken) -> Result<bool> {
            let seen = self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(seen >= self.checks_until_up)
        }
    }

    fn units() -> Vec<String> {
        vec!["app".to_string(), "worker".to_string()]
    }

    #[tokio::test]
    async fn test_restart_all_collects_failures() -> Result<()> {
        let manager = SlowStart {
            checks_until_up: 0,
            checks: AtomicU32::new(0),
            broken: HashSet::from(["worker".to_string()]),
            restarted: Mutex::new(Vec::new()),
        };

        let failed = restart_all(&manager, &units(), &CancellationToken::new()).await?;
        assert_eq!(failed, vec!["worker"]);
        assert_eq!(*manager.restarted.lock().unwrap(), vec!["app"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_until_healthy_retries() -> Result<()> {
        let manager = SlowStart {
            checks_until_up: 4,
            checks: AtomicU32::new(0),
            broken: HashSet::new(),
            restarted: Mutex::new(Vec::new()),
        };

        let healthy = wait_until_healthy(
            &manager,
            &units(),
            2,
            5,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(healthy, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_until_healthy_gives_up() -> Result<()> {
        let manager = SlowStart {
            checks_until_up: u32::MAX,
            checks: AtomicU32::new(0),
            broken: HashSet::new(),
            restarted: Mutex::new(Vec::new()),
        };

        let healthy = wait_until_healthy(
            &manager,
            &units(),
            1,
            3,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(healthy, 0);
        Ok(())
    }
}
