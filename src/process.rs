//! Signal delivery and bounded waits for process exit.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::liveness::LivenessProbe;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
pub fn send_signal(pid: i32, signal: Signal) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    }
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: plain kill(2) on a single positive pid.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: i32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signals are only supported on unix",
    ))
}

/// Poll `probe` until `pid` is gone or `timeout` elapses.
pub fn wait_for_exit(probe: &dyn LivenessProbe, pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !probe.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return !probe.is_alive(pid);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Forced,
    /// Still alive after SIGKILL and the kill wait.
    StillAlive { after: Duration },
    /// Signal delivery itself failed, typically EPERM.
    SignalFailed(String),
}

/// SIGTERM, wait up to `grace`, then SIGKILL and wait up to `kill_wait`.
pub fn terminate(
    probe: &dyn LivenessProbe,
    pid: i32,
    grace: Duration,
    kill_wait: Duration,
) -> Termination {
    match send_signal(pid, Signal::Terminate) {
        Ok(()) => {
            if wait_for_exit(probe, pid, grace) {
                debug!(pid, "process exited after SIGTERM");
                return Termination::Graceful;
            }
        }
        Err(e) if is_no_such_process(&e) => return Termination::Graceful,
        Err(e) => warn!(pid, error = %e, "SIGTERM failed, escalating"),
    }

    match send_signal(pid, Signal::Kill) {
        Ok(()) => {
            if wait_for_exit(probe, pid, kill_wait) {
                Termination::Forced
            } else {
                Termination::StillAlive {
                    after: grace + kill_wait,
                }
            }
        }
        Err(e) if is_no_such_process(&e) => Termination::Forced,
        Err(e) => Termination::SignalFailed(format!("failed to SIGKILL pid {pid}: {e}")),
    }
}

#[cfg(unix)]
fn is_no_such_process(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_no_such_process(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::ProcessTableProbe;
    use std::process::{Child, Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    /// Reap in the background so the probe does not see a lingering zombie.
    fn reap(child: Child) {
        std::thread::spawn(move || {
            let mut child = child;
            let _ = child.wait();
        });
    }

    #[test]
    fn terminates_cooperative_process_gracefully() {
        let child = spawn("sleep", &["30"]);
        let pid = child.id() as i32;
        reap(child);

        let outcome = terminate(
            &ProcessTableProbe,
            pid,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert_eq!(outcome, Termination::Graceful);
        assert!(!ProcessTableProbe.is_alive(pid));
    }

    #[test]
    fn escalates_when_sigterm_is_ignored() {
        let child = spawn("sh", &["-c", "trap '' TERM; sleep 30"]);
        let pid = child.id() as i32;
        reap(child);
        // Let the shell install its trap before signalling.
        std::thread::sleep(Duration::from_millis(200));

        let outcome = terminate(
            &ProcessTableProbe,
            pid,
            Duration::from_millis(300),
            Duration::from_secs(5),
        );
        assert_eq!(outcome, Termination::Forced);
        assert!(!ProcessTableProbe.is_alive(pid));
    }

    #[test]
    fn wait_for_exit_times_out_on_live_process() {
        let mut child = spawn("sleep", &["30"]);
        let pid = child.id() as i32;
        assert!(!wait_for_exit(&ProcessTableProbe, pid, Duration::from_millis(100)));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn refuses_non_positive_pids() {
        assert!(send_signal(0, Signal::Terminate).is_err());
        assert!(send_signal(-1, Signal::Kill).is_err());
    }
}
