//! External process execution with bounded timeouts and cancellation.
//!
//! Every dump, restore, query and service command goes through [`run`]. The
//! child is killed when its future is dropped, so a timeout or a cancelled
//! token never leaves an orphaned `pg_restore` behind.

use crate::utils::errors::{BackupError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A fully described external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Diagnostics split by severity prefix.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::parse(&self.stderr)
    }

    /// Turn a non-zero exit into a `ProcessFailed` error.
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }

        let diagnostics = self.diagnostics();
        let detail = if diagnostics.errors.is_empty() {
            last_lines(&self.stderr, 5)
        } else {
            diagnostics.errors.join("; ")
        };

        Err(BackupError::ProcessFailed {
            program: program.to_string(),
            status: describe_status(&self.status),
            detail,
        })
    }
}

/// stderr lines grouped by the severity tag the PostgreSQL client tools put
/// after the program name (`pg_restore: error: ...`).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub other: Vec<String>,
}

impl Diagnostics {
    pub fn parse(stderr: &str) -> Self {
        let mut diagnostics = Diagnostics::default();

        for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match severity(line) {
                Some(Severity::Error) => diagnostics.errors.push(line.to_string()),
                Some(Severity::Warning) => diagnostics.warnings.push(line.to_string()),
                None => diagnostics.other.push(line.to_string()),
            }
        }

        diagnostics
    }
}

enum Severity {
    Error,
    Warning,
}

fn severity(line: &str) -> Option<Severity> {
    // "<program>: <severity>: <message>" or "<SEVERITY>:  <message>"
    let mut parts = line.splitn(3, ':').map(str::trim);
    let first = parts.next()?;
    let candidates = [Some(first), parts.next()];

    for tag in candidates.into_iter().flatten() {
        match tag.to_ascii_lowercase().as_str() {
            "error" | "fatal" | "panic" => return Some(Severity::Error),
            "warning" => return Some(Severity::Warning),
            _ => {}
        }
    }
    None
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("; ")
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "signal termination".to_string(),
    }
}

/// Locate an executable on `PATH` (or verify an explicit path).
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

/// Fail with `MissingTool` unless every program can be found.
pub fn require_tools(programs: &[&str]) -> Result<()> {
    for program in programs {
        if find_program(program).is_none() {
            return Err(BackupError::MissingTool(program.to_string()));
        }
    }
    Ok(())
}

/// Run a command to completion, bounded by `timeout` and `cancel`.
///
/// A non-zero exit is returned as `Ok`; callers decide with
/// [`CommandOutput::check`] whether it is fatal.
pub async fn run(
    spec: &CommandSpec,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }

    debug!("Running {} {:?}", spec.program, spec.args);

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackupError::MissingTool(spec.program.clone())
        } else {
            BackupError::Io(e)
        }
    })?;
    let pid = child.id();

    tokio::select! {
        output = child.wait_with_output() => {
            let output = output?;
            Ok(CommandOutput {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        _ = tokio::time::sleep(timeout) => {
            terminate(pid, &spec.program);
            Err(BackupError::Timeout {
                program: spec.program.clone(),
                timeout,
            })
        }
        _ = cancel.cancelled() => {
            terminate(pid, &spec.program);
            Err(BackupError::Cancelled)
        }
    }
}

/// Ask the child to stop; `kill_on_drop` follows up with SIGKILL.
fn terminate(pid: Option<u32>, program: &str) {
    let Some(pid) = pid else { return };
    warn!("Terminating {} (pid {})", program, pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
}
