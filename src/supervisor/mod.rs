//! Control surface for the detached worker.
//!
//! The facade owns no handle to the worker: every query re-reads the pid file
//! and asks the process table. Mutating operations (`start`, `ensure_running`,
//! `stop`) are single-flight across threads and supervisor processes.

mod lock;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::ProjectConfig;
use crate::elevation::PrivilegeElevator;
use crate::error::{FailureKind, tagged};
use crate::launcher::{LauncherConfig, WorkerCommand, WorkerLauncher};
use crate::liveness::LivenessProbe;
use crate::paths::{StatePaths, lock_file_for};
use crate::pidfile::PidFileStore;
use crate::process::{Termination, terminate};
use crate::sensor;

use lock::MutationLock;

/// Outcome of a control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SupervisorResult {
    Started { pid: i32 },
    AlreadyRunning { pid: i32 },
    Stopped { pid: i32 },
    NotRunning,
    Failed { kind: FailureKind, reason: String },
}

impl SupervisorResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, SupervisorResult::Failed { .. })
    }

    pub fn pid(&self) -> Option<i32> {
        match self {
            SupervisorResult::Started { pid }
            | SupervisorResult::AlreadyRunning { pid }
            | SupervisorResult::Stopped { pid } => Some(*pid),
            SupervisorResult::NotRunning | SupervisorResult::Failed { .. } => None,
        }
    }
}

impl fmt::Display for SupervisorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorResult::Started { pid } => write!(f, "Started (pid {pid})"),
            SupervisorResult::AlreadyRunning { pid } => write!(f, "AlreadyRunning (pid {pid})"),
            SupervisorResult::Stopped { pid } => write!(f, "Stopped (pid {pid})"),
            SupervisorResult::NotRunning => write!(f, "NotRunning"),
            SupervisorResult::Failed { kind, reason } => write!(f, "Failed [{kind}]: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Pid record could not be read, so liveness is unresolved.
    Unknown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Stopped => "Stopped",
            SupervisorState::Starting => "Starting",
            SupervisorState::Running => "Running",
            SupervisorState::Stopping => "Stopping",
            SupervisorState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A pid that was alive when `found_at` was taken. Valid for one call only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerIdentity {
    pub pid: i32,
    pub found_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running(WorkerIdentity),
    Stopped,
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running(_))
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Running(identity) => write!(f, "Running (pid {})", identity.pid),
            WorkerStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Full state as seen by one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: SupervisorState,
    pub pid: Option<i32>,
    pub checked_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub paths: StatePaths,
    pub launcher: LauncherConfig,
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub stop_grace: Duration,
    pub stop_kill_wait: Duration,
}

impl SupervisorConfig {
    /// Defaults for everything but the files and the worker command.
    pub fn new(paths: StatePaths, worker: WorkerCommand) -> Self {
        let mut launcher = LauncherConfig::new(worker);
        launcher.working_dir = Some(paths.state_dir.clone());
        Self {
            paths,
            launcher,
            stop_grace: Duration::from_millis(2000),
            stop_kill_wait: Duration::from_millis(1000),
        }
    }

    /// `config_path` is handed to the worker so it loads the same file.
    pub fn from_project(
        config: &ProjectConfig,
        config_path: Option<&Path>,
        paths: StatePaths,
    ) -> Result<Self> {
        let worker = match &config.launcher.program {
            Some(program) => WorkerCommand::new(program, config.launcher.args.clone()),
            None => WorkerCommand::current_exe()?,
        };
        let mut supervisor = Self::new(paths, worker);
        supervisor.launcher.discovery_retries = config.launcher.discovery_retries;
        supervisor.launcher.discovery_interval = config.launcher.discovery_interval();
        supervisor.launcher.oom_score_adj = config.elevation.oom_score_adj;
        supervisor.launcher.config_file = config_path.map(Path::to_path_buf);
        supervisor.stop_grace = Duration::from_millis(config.stop.grace_millis);
        supervisor.stop_kill_wait = Duration::from_millis(config.stop.kill_wait_millis);
        Ok(supervisor)
    }
}

const PHASE_IDLE: u8 = 0;
const PHASE_STARTING: u8 = 1;
const PHASE_STOPPING: u8 = 2;

/// Marks a mutation in flight for `state()`; resets on drop.
struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a AtomicU8, value: u8) -> Self {
        phase.store(value, Ordering::SeqCst);
        Self { phase }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
    }
}

pub struct SupervisorFacade {
    config: SupervisorConfig,
    pids: PidFileStore,
    probe: Arc<dyn LivenessProbe>,
    audit: AuditLog,
    launcher: WorkerLauncher,
    mutation: MutationLock,
    phase: AtomicU8,
}

impl SupervisorFacade {
    pub fn new(
        config: SupervisorConfig,
        probe: Arc<dyn LivenessProbe>,
        elevator: Arc<dyn PrivilegeElevator>,
    ) -> Self {
        let pids = PidFileStore::new(&config.paths.pid_file);
        let audit = AuditLog::new(&config.paths.log_file);
        let launcher = WorkerLauncher::new(
            pids.clone(),
            Arc::clone(&probe),
            elevator,
            audit.clone(),
            config.launcher.clone(),
        );
        Self {
            config,
            pids,
            probe,
            audit,
            launcher,
            mutation: MutationLock::new(),
            phase: AtomicU8::new(PHASE_IDLE),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Launch the worker unless a tracked one is alive.
    pub fn start(&self) -> SupervisorResult {
        self.start_with_cause("start requested")
    }

    /// Same as [`start`](Self::start), for boot and periodic triggers.
    pub fn ensure_running(&self) -> SupervisorResult {
        self.start_with_cause("ensure-running trigger")
    }

    fn start_with_cause(&self, cause: &str) -> SupervisorResult {
        let lock_path = lock_file_for(self.pids.path());
        let _guard = match self.mutation.acquire(&lock_path, true) {
            Ok(guard) => guard,
            Err(e) => {
                return self.fail(
                    FailureKind::IoFailure,
                    format!("cannot take supervisor lock {}: {e}", lock_path.display()),
                );
            }
        };

        if let Some(pid) = self.current_pid() {
            debug!(pid, cause, "worker already running");
            return SupervisorResult::AlreadyRunning { pid };
        }

        let _phase = PhaseGuard::enter(&self.phase, PHASE_STARTING);
        let paths = &self.config.paths;
        self.audit.record(&format!(
            "{cause}; pid file {}, sensor {}, event store {}",
            paths.pid_file.display(),
            paths.sensor_file.display(),
            paths.event_db.display()
        ));
        let result = self.launcher.launch(&paths.sensor_file, &paths.event_db);
        info!(%result, "start finished");
        result
    }

    /// Terminate the tracked worker. The pid file is left in place.
    pub fn stop(&self) -> SupervisorResult {
        let lock_path = lock_file_for(self.pids.path());
        let _guard = match self.mutation.acquire(&lock_path, false) {
            Ok(guard) => guard,
            Err(e) => {
                return self.fail(
                    FailureKind::IoFailure,
                    format!("cannot take supervisor lock {}: {e}", lock_path.display()),
                );
            }
        };

        let recorded = match self.pids.read() {
            Ok(record) => record.pid(),
            Err(e) => {
                return self.fail(
                    FailureKind::IoFailure,
                    format!("cannot tell which worker to stop: {e}"),
                );
            }
        };
        let Some(pid) = recorded.filter(|pid| self.probe.is_alive(*pid)) else {
            debug!(?recorded, "stop requested but no live worker");
            return SupervisorResult::NotRunning;
        };

        let _phase = PhaseGuard::enter(&self.phase, PHASE_STOPPING);
        self.audit.record(&format!("stop requested for worker pid {pid}"));
        match terminate(
            &*self.probe,
            pid,
            self.config.stop_grace,
            self.config.stop_kill_wait,
        ) {
            Termination::Graceful => {
                info!(pid, "worker stopped");
                self.audit
                    .record(&format!("worker pid {pid} stopped after SIGTERM"));
                SupervisorResult::Stopped { pid }
            }
            Termination::Forced => {
                info!(pid, "worker killed");
                self.audit.record(&format!(
                    "worker pid {pid} ignored SIGTERM for {}ms, stopped with SIGKILL",
                    self.config.stop_grace.as_millis()
                ));
                SupervisorResult::Stopped { pid }
            }
            Termination::StillAlive { after } => self.fail(
                FailureKind::TimedOut,
                format!(
                    "worker pid {pid} still alive {}ms after SIGKILL was sent",
                    after.as_millis()
                ),
            ),
            Termination::SignalFailed(reason) => self.fail(FailureKind::Denied, reason),
        }
    }

    /// Live tracked pid, re-derived from disk and the process table.
    pub fn current_pid(&self) -> Option<i32> {
        self.pids
            .read()
            .ok()?
            .pid()
            .filter(|pid| self.probe.is_alive(*pid))
    }

    pub fn status(&self) -> WorkerStatus {
        match self.current_pid() {
            Some(pid) => WorkerStatus::Running(WorkerIdentity {
                pid,
                found_at: Local::now(),
            }),
            None => WorkerStatus::Stopped,
        }
    }

    /// All five states. `Starting` and `Stopping` are only visible while this
    /// facade itself has the mutation in flight.
    pub fn snapshot(&self) -> StatusSnapshot {
        let (derived, pid) = match self.pids.read() {
            Ok(record) => match record.pid().filter(|pid| self.probe.is_alive(*pid)) {
                Some(pid) => (SupervisorState::Running, Some(pid)),
                None => (SupervisorState::Stopped, None),
            },
            Err(e) => {
                debug!(error = %e, "pid file unreadable");
                (SupervisorState::Unknown, None)
            }
        };
        let state = match self.phase.load(Ordering::SeqCst) {
            PHASE_STARTING => SupervisorState::Starting,
            PHASE_STOPPING => SupervisorState::Stopping,
            _ => derived,
        };
        StatusSnapshot {
            state,
            pid,
            checked_at: Local::now(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.snapshot().state
    }

    /// Configured sensor value, or [`sensor::SENSOR_UNAVAILABLE`].
    pub fn read_sensor(&self) -> i64 {
        sensor::read_sensor(&self.config.paths.sensor_file)
    }

    fn fail(&self, kind: FailureKind, reason: String) -> SupervisorResult {
        warn!(%kind, reason = %reason, "supervisor operation failed");
        self.audit.record(&tagged(kind, &reason));
        SupervisorResult::Failed { kind, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::DisabledElevator;
    use crate::liveness::ProcessTableProbe;
    use crate::process::{Signal, send_signal};

    fn facade_in(dir: &Path) -> SupervisorFacade {
        let mut config = SupervisorConfig::new(
            StatePaths::in_dir(dir),
            WorkerCommand::new("sleep", vec!["30".to_string()]),
        );
        config.launcher.discovery_interval = Duration::from_millis(20);
        config.stop_grace = Duration::from_secs(3);
        SupervisorFacade::new(
            config,
            Arc::new(ProcessTableProbe),
            Arc::new(DisabledElevator),
        )
    }

    #[test]
    fn result_display_and_success() {
        assert_eq!(
            SupervisorResult::Started { pid: 7 }.to_string(),
            "Started (pid 7)"
        );
        assert_eq!(SupervisorResult::NotRunning.to_string(), "NotRunning");
        let failed = SupervisorResult::Failed {
            kind: FailureKind::TimedOut,
            reason: "slow".to_string(),
        };
        assert_eq!(failed.to_string(), "Failed [TimedOut]: slow");
        assert!(!failed.is_success());
        assert!(SupervisorResult::NotRunning.is_success());
        assert_eq!(failed.pid(), None);
    }

    #[test]
    fn result_serializes_with_tag() {
        let json = serde_json::to_value(SupervisorResult::AlreadyRunning { pid: 3 }).unwrap();
        assert_eq!(json["result"], "already_running");
        assert_eq!(json["pid"], 3);
    }

    #[test]
    fn fresh_directory_is_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let facade = facade_in(tmp.path());
        assert_eq!(facade.status(), WorkerStatus::Stopped);
        assert_eq!(facade.current_pid(), None);
        assert_eq!(facade.state(), SupervisorState::Stopped);
    }

    #[test]
    fn corrupt_pid_file_reads_as_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("screenlogger.pid"), "not-a-pid").unwrap();
        let facade = facade_in(tmp.path());
        assert_eq!(facade.state(), SupervisorState::Stopped);
    }

    #[test]
    fn unreadable_pid_file_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the pid file should be cannot be read as text.
        std::fs::create_dir(tmp.path().join("screenlogger.pid")).unwrap();
        let facade = facade_in(tmp.path());
        assert_eq!(facade.state(), SupervisorState::Unknown);
        assert_eq!(facade.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn start_then_stop_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let facade = facade_in(tmp.path());

        let SupervisorResult::Started { pid } = facade.start() else {
            panic!("expected Started");
        };
        assert_eq!(facade.current_pid(), Some(pid));
        assert_eq!(facade.state(), SupervisorState::Running);

        assert_eq!(facade.stop(), SupervisorResult::Stopped { pid });
        assert_eq!(facade.status(), WorkerStatus::Stopped);
        // Dead pid stays on record as history.
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("screenlogger.pid")).unwrap(),
            format!("{pid}\n")
        );
        assert_eq!(facade.stop(), SupervisorResult::NotRunning);
    }

    #[test]
    fn start_audits_cause_and_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let facade = facade_in(tmp.path());

        let result = facade.ensure_running();
        let pid = result.pid().unwrap();
        let log = facade.audit().read_all().unwrap();
        assert!(log.contains("ensure-running trigger; pid file "), "log: {log}");
        assert!(log.contains("screen_logger.db"));

        let _ = send_signal(pid, Signal::Kill);
    }

    #[test]
    fn stop_without_lock_file_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let facade = facade_in(tmp.path());
        assert_eq!(facade.stop(), SupervisorResult::NotRunning);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn stop_escalates_to_sigkill() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = SupervisorConfig::new(
            StatePaths::in_dir(tmp.path()),
            WorkerCommand::new(
                "sh",
                vec!["-c".to_string(), "trap '' TERM; while :; do sleep 1; done".to_string()],
            ),
        );
        config.launcher.discovery_interval = Duration::from_millis(20);
        config.stop_grace = Duration::from_millis(300);
        config.stop_kill_wait = Duration::from_secs(5);
        let facade = SupervisorFacade::new(
            config,
            Arc::new(ProcessTableProbe),
            Arc::new(DisabledElevator),
        );

        let SupervisorResult::Started { pid } = facade.start() else {
            panic!("expected Started");
        };
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(facade.stop(), SupervisorResult::Stopped { pid });
        assert!(facade.audit().read_all().unwrap().contains("SIGKILL"));
    }

    #[test]
    fn phase_guard_resets_on_drop() {
        let phase = AtomicU8::new(PHASE_IDLE);
        {
            let _guard = PhaseGuard::enter(&phase, PHASE_STOPPING);
            assert_eq!(phase.load(Ordering::SeqCst), PHASE_STOPPING);
        }
        assert_eq!(phase.load(Ordering::SeqCst), PHASE_IDLE);
    }

    #[test]
    fn from_project_applies_settings() {
        let mut project = ProjectConfig::default();
        project.launcher.program = Some("/opt/worker".to_string());
        project.launcher.args = vec!["run".to_string()];
        project.launcher.discovery_retries = 3;
        project.elevation.oom_score_adj = -1000;
        project.stop.grace_millis = 10;

        let paths = StatePaths::in_dir(Path::new("/tmp/screenlogger-test"));
        let source = Path::new("/proj/.screenlogger/config.toml");
        let config = SupervisorConfig::from_project(&project, Some(source), paths).unwrap();
        assert_eq!(
            config.launcher.worker,
            WorkerCommand::new("/opt/worker", vec!["run".to_string()])
        );
        assert_eq!(config.launcher.discovery_retries, 3);
        assert_eq!(config.launcher.oom_score_adj, -1000);
        assert_eq!(config.stop_grace, Duration::from_millis(10));
        assert_eq!(
            config.launcher.working_dir.as_deref(),
            Some(Path::new("/tmp/screenlogger-test"))
        );
        assert_eq!(config.launcher.config_file.as_deref(), Some(source));
    }
}
