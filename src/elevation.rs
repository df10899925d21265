//! Privileged side channel for lowering the worker's eviction priority.
//!
//! The elevator runs one shell command under elevated credentials and waits
//! for it, never longer than its timeout. Callers treat every failure as
//! non-fatal: a worker without OOM protection still runs.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ElevationSettings;
use crate::error::{FailureKind, tagged};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured output of a successful elevated command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElevationOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ElevationError {
    #[error("elevated command refused (exit code {code:?}): {stderr}")]
    Denied { code: Option<i32>, stderr: String },
    #[error("elevation program '{program}' unavailable: {reason}")]
    Unavailable { program: String, reason: String },
    #[error("elevated command did not finish within {}ms", .after.as_millis())]
    TimedOut { after: Duration },
}

impl ElevationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ElevationError::Denied { .. } => FailureKind::Denied,
            ElevationError::Unavailable { .. } => FailureKind::Unavailable,
            ElevationError::TimedOut { .. } => FailureKind::TimedOut,
        }
    }
}

pub trait PrivilegeElevator: Send + Sync {
    /// Run `command` with elevated credentials, blocking until it exits or
    /// the implementation's timeout elapses.
    fn run(&self, command: &str) -> Result<ElevationOutput, ElevationError>;
}

/// Runs `<program> <args...> <command>`, e.g. `su -c "<command>"`.
#[derive(Debug, Clone)]
pub struct ShellElevator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ShellElevator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// `su -c <command>`.
    pub fn su(timeout: Duration) -> Self {
        Self::new("su", vec!["-c".to_string()], timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl PrivilegeElevator for ShellElevator {
    fn run(&self, command: &str) -> Result<ElevationOutput, ElevationError> {
        debug!(program = %self.program, command, "running elevated command");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ElevationError::Unavailable {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let deadline = Instant::now() + self.timeout;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_deadline(&mut child, deadline) {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(program = %self.program, command, "elevated command timed out");
                return Err(ElevationError::TimedOut {
                    after: self.timeout,
                });
            }
        };

        // A grandchild that inherited the pipes can hold them open after
        // the direct child exits.
        let (Some(stdout), Some(stderr)) = (collect(&stdout, deadline), collect(&stderr, deadline))
        else {
            warn!(program = %self.program, command, "elevated command output still open at deadline");
            return Err(ElevationError::TimedOut {
                after: self.timeout,
            });
        };
        let output = ElevationOutput { stdout, stderr };
        if status.success() {
            Ok(output)
        } else {
            Err(ElevationError::Denied {
                code: status.code(),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Used when elevation is switched off in configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledElevator;

impl PrivilegeElevator for DisabledElevator {
    fn run(&self, _command: &str) -> Result<ElevationOutput, ElevationError> {
        Err(ElevationError::Unavailable {
            program: "(none)".to_string(),
            reason: "elevation disabled in configuration".to_string(),
        })
    }
}

/// Elevator described by the `[elevation]` config section.
pub fn from_settings(settings: &ElevationSettings) -> Arc<dyn PrivilegeElevator> {
    if settings.enabled {
        Arc::new(ShellElevator::new(
            settings.program.clone(),
            settings.args.clone(),
            Duration::from_secs(settings.timeout_secs),
        ))
    } else {
        Arc::new(DisabledElevator)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Output of one drained pipe, or `None` if it is still open at `deadline`.
fn collect(rx: &Receiver<String>, deadline: Instant) -> Option<String> {
    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .ok()
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Option<std::process::ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to poll elevated command");
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Shell command that sets a process's OOM score adjustment.
pub fn oom_adjust_command(pid: i32, score: i32) -> String {
    format!("echo {score} > /proc/{pid}/oom_score_adj")
}

/// Current OOM score adjustment of `pid`, read without privileges.
pub fn read_oom_score_adj(pid: i32) -> Option<i32> {
    std::fs::read_to_string(format!("/proc/{pid}/oom_score_adj"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Ask the OS to deprioritize `pid` for eviction, then read back the value
/// that actually took effect.
pub fn protect_from_eviction(
    elevator: &dyn PrivilegeElevator,
    pid: i32,
    score: i32,
) -> Result<Option<i32>, ElevationError> {
    elevator.run(&oom_adjust_command(pid, score))?;
    Ok(read_oom_score_adj(pid))
}

/// Audit line for the outcome of [`protect_from_eviction`].
pub fn describe_protection(
    pid: i32,
    requested: i32,
    outcome: &Result<Option<i32>, ElevationError>,
) -> String {
    match outcome {
        Ok(Some(effective)) if *effective == requested => {
            format!("oom_score_adj for pid {pid} set to {effective}")
        }
        Ok(Some(effective)) => format!(
            "oom_score_adj command for pid {pid} succeeded but effective value is {effective} (requested {requested})"
        ),
        Ok(None) => format!(
            "oom_score_adj command for pid {pid} succeeded; effective value unreadable"
        ),
        Err(e) => tagged(
            e.kind(),
            format!("eviction protection for pid {pid} failed, running unprotected: {e}"),
        ),
    }
}
