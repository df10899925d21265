//! Detached worker launch.
//!
//! Launch order is fixed: check for a live tracked worker, spawn, wait until
//! the new pid is visible in the process table, attempt eviction protection,
//! and only then record the pid. A worker that never becomes visible is
//! killed and never recorded.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::elevation::{PrivilegeElevator, describe_protection, protect_from_eviction};
use crate::error::{FailureKind, tagged};
use crate::liveness::LivenessProbe;
use crate::pidfile::PidFileStore;
use crate::process::{Signal, send_signal};
use crate::supervisor::SupervisorResult;

pub const ENV_SENSOR: &str = "SCREENLOGGER_SENSOR";
pub const ENV_EVENT_DB: &str = "SCREENLOGGER_EVENT_DB";
pub const ENV_AUDIT_LOG: &str = "SCREENLOGGER_AUDIT_LOG";
pub const ENV_CONFIG: &str = "SCREENLOGGER_CONFIG";

/// Program and arguments that start the worker's main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// This executable in hidden `worker` mode.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("failed to resolve screenlogger binary")?;
        Ok(Self::new(exe, vec!["worker".to_string()]))
    }
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub worker: WorkerCommand,
    /// Maximum discovery wait is `discovery_retries * discovery_interval`.
    pub discovery_retries: u32,
    pub discovery_interval: Duration,
    pub oom_score_adj: i32,
    /// Working directory for the detached worker.
    pub working_dir: Option<PathBuf>,
    /// Config file the worker should load instead of searching from its
    /// working directory.
    pub config_file: Option<PathBuf>,
}

impl LauncherConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            discovery_retries: 20,
            discovery_interval: Duration::from_millis(100),
            oom_score_adj: -17,
            working_dir: None,
            config_file: None,
        }
    }

    pub fn max_discovery_wait(&self) -> Duration {
        self.discovery_interval * self.discovery_retries
    }
}

pub struct WorkerLauncher {
    pids: PidFileStore,
    probe: Arc<dyn LivenessProbe>,
    elevator: Arc<dyn PrivilegeElevator>,
    audit: AuditLog,
    config: LauncherConfig,
}

impl WorkerLauncher {
    pub fn new(
        pids: PidFileStore,
        probe: Arc<dyn LivenessProbe>,
        elevator: Arc<dyn PrivilegeElevator>,
        audit: AuditLog,
        config: LauncherConfig,
    ) -> Self {
        Self {
            pids,
            probe,
            elevator,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Start a worker unless a tracked one is alive. Never panics or errors;
    /// every failure becomes `SupervisorResult::Failed` plus an audit line.
    pub fn launch(&self, sensor_path: &Path, store_path: &Path) -> SupervisorResult {
        match self.pids.read() {
            Ok(record) => {
                if let Some(pid) = record.pid().filter(|pid| self.probe.is_alive(*pid)) {
                    return SupervisorResult::AlreadyRunning { pid };
                }
            }
            Err(e) => {
                return self.fail(
                    FailureKind::IoFailure,
                    format!("cannot tell whether a worker is already running: {e}"),
                );
            }
        }

        let mut child = match self.spawn(sensor_path, store_path) {
            Ok(child) => child,
            Err(e) => {
                let kind = if e.kind() == io::ErrorKind::NotFound {
                    FailureKind::Unavailable
                } else {
                    FailureKind::IoFailure
                };
                return self.fail(
                    kind,
                    format!(
                        "failed to spawn worker {}: {e}",
                        self.config.worker.program.display()
                    ),
                );
            }
        };
        let pid = child.id() as i32;
        info!(pid, program = %self.config.worker.program.display(), "worker spawned");

        if !self.await_discovery(pid) {
            let _ = child.kill();
            let _ = child.wait();
            return self.fail(
                FailureKind::NotDiscoverable,
                format!(
                    "worker pid {pid} not visible after {} attempts ({}ms); killed",
                    self.config.discovery_retries,
                    self.config.max_discovery_wait().as_millis()
                ),
            );
        }
        reap_in_background(child);

        let outcome = protect_from_eviction(&*self.elevator, pid, self.config.oom_score_adj);
        if let Err(e) = &outcome {
            warn!(pid, error = %e, "worker running without eviction protection");
        }
        self.audit
            .record(&describe_protection(pid, self.config.oom_score_adj, &outcome));

        if let Err(e) = self.pids.write(pid) {
            // An unrecorded worker can never be found again; don't leave it behind.
            let _ = send_signal(pid, Signal::Kill);
            return self.fail(
                FailureKind::IoFailure,
                format!("worker pid {pid} could not be recorded, killed it: {e}"),
            );
        }

        self.audit
            .record(&format!("worker started, pid {pid} recorded in {}", self.pids.path().display()));
        SupervisorResult::Started { pid }
    }

    fn spawn(&self, sensor_path: &Path, store_path: &Path) -> io::Result<Child> {
        let worker = &self.config.worker;
        let mut cmd = Command::new(&worker.program);
        cmd.args(&worker.args)
            .env(ENV_SENSOR, sensor_path)
            .env(ENV_EVENT_DB, store_path)
            .env(ENV_AUDIT_LOG, self.audit.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = &self.config.working_dir {
            std::fs::create_dir_all(dir)?;
            cmd.current_dir(dir);
        }
        if let Some(config_file) = &self.config.config_file {
            cmd.env(ENV_CONFIG, config_file);
        }

        // New session: no controlling terminal, so neither a Ctrl-C nor a
        // hangup of the caller's terminal reaches the worker.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and the closure touches no
            // state shared with the parent.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd.spawn()
    }

    fn await_discovery(&self, pid: i32) -> bool {
        for attempt in 0..self.config.discovery_retries.max(1) {
            if self.probe.is_alive(pid) {
                return true;
            }
            if attempt + 1 < self.config.discovery_retries {
                thread::sleep(self.config.discovery_interval);
            }
        }
        false
    }

    fn fail(&self, kind: FailureKind, reason: String) -> SupervisorResult {
        warn!(%kind, reason = %reason, "worker launch failed");
        self.audit.record(&tagged(kind, &reason));
        SupervisorResult::Failed { kind, reason }
    }
}

/// Keep waiting on the child so an early exit is reaped instead of lingering
/// as a zombie for as long as this process lives.
fn reap_in_background(mut child: Child) {
    let spawned = thread::Builder::new()
        .name("worker-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start worker reaper thread");
    }
}
