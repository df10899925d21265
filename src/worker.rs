//! Detached worker entry point.
//!
//! Started by the launcher as `screenlogger worker`. It protects itself from
//! eviction, then samples the sensor every tick and stores screen on/off
//! transitions until SIGTERM or SIGINT arrives. The pid file is left alone on
//! exit: a dead pid on record is history, not an error.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, now_timestamp};
use crate::config::ElevationSettings;
use crate::elevation::{self, describe_protection, protect_from_eviction};
use crate::error::{FailureKind, tagged};
use crate::sensor::{ScreenState, read_sensor};
use crate::store::{EventStore, EventType};

pub const WORKER_PROCESS_NAME: &str = "screenlogger_worker";

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub sensor_path: PathBuf,
    pub event_db: PathBuf,
    pub audit_log: PathBuf,
    pub tick: Duration,
    pub elevation: ElevationSettings,
}

/// Tracks the last known screen state and reports changes.
#[derive(Debug, Default)]
pub struct ScreenSampler {
    last: Option<ScreenState>,
}

impl ScreenSampler {
    /// Feed one brightness reading. The first valid reading only sets the
    /// baseline; unavailable readings are ignored.
    pub fn observe(&mut self, brightness: i64) -> Option<EventType> {
        let state = ScreenState::from_brightness(brightness)?;
        let previous = self.last.replace(state);
        match previous {
            Some(prev) if prev != state => Some(state.into()),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<ScreenState> {
        self.last
    }
}

/// Run the worker until a termination signal arrives.
pub fn run(options: WorkerOptions) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install termination handler")?;

    set_process_name(WORKER_PROCESS_NAME);

    let audit = AuditLog::new(&options.audit_log);
    let pid = std::process::id() as i32;
    info!(pid, sensor = %options.sensor_path.display(), "worker starting");
    audit.record(&format!(
        "worker pid {pid} running, sensor {}, event store {}",
        options.sensor_path.display(),
        options.event_db.display()
    ));

    let elevator = elevation::from_settings(&options.elevation);
    let score = options.elevation.oom_score_adj;
    let outcome = protect_from_eviction(&*elevator, pid, score);
    audit.record(&describe_protection(pid, score, &outcome));

    let store = match EventStore::open(&options.event_db) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "worker continuing without event store");
            audit.record(&tagged(
                FailureKind::IoFailure,
                format!(
                    "event store {} unavailable, transitions will not be stored: {e}",
                    options.event_db.display()
                ),
            ));
            None
        }
    };

    let stored = run_loop(&options, store.as_ref(), &stop);
    audit.record(&format!(
        "worker pid {pid} exiting on termination signal after storing {stored} events"
    ));
    Ok(())
}

/// Sample every tick until `stop` is set. Returns how many events were stored.
pub fn run_loop(options: &WorkerOptions, store: Option<&EventStore>, stop: &AtomicBool) -> usize {
    let mut sampler = ScreenSampler::default();
    let mut stored = 0;
    while !stop.load(Ordering::Relaxed) {
        if let Some(event) = sampler.observe(read_sensor(&options.sensor_path)) {
            let timestamp = now_timestamp();
            info!(%event, %timestamp, "screen transition");
            if let Some(store) = store {
                match store.insert(event, &timestamp) {
                    Ok(_) => stored += 1,
                    Err(e) => warn!(error = %e, %event, "failed to store screen event"),
                }
            }
        }
        std::thread::sleep(options.tick);
    }
    debug!(stored, "worker loop finished");
    stored
}

#[cfg(target_os = "linux")]
fn set_process_name(name: &str) {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return;
    };
    // SAFETY: PR_SET_NAME copies at most 16 bytes from a valid NUL-terminated
    // string that outlives the call.
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        debug!(error = %std::io::Error::last_os_error(), "failed to set process name");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_name(_name: &str) {}
