//! Process-table liveness checks.
//!
//! A positive answer only means "some process with this pid exists". Once the
//! worker is detached there is no privilege-free way to prove it is still
//! *our* worker, so a recycled pid reads as alive.

/// Answers whether a pid currently names a live process.
pub trait LivenessProbe: Send + Sync {
    /// Never errors: invalid or vanished pids are simply not alive.
    fn is_alive(&self, pid: i32) -> bool;
}

/// Probe backed by `kill(pid, 0)` and, on Linux, `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTableProbe;

impl LivenessProbe for ProcessTableProbe {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        if !signal_zero(pid) {
            return false;
        }
        // A zombie still answers signal 0 until its parent reaps it.
        !matches!(proc_state(pid), Some('Z' | 'X'))
    }
}

#[cfg(unix)]
fn signal_zero(pid: i32) -> bool {
    // SAFETY: signal 0 performs the existence and permission check only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn signal_zero(_pid: i32) -> bool {
    false
}

/// Single-letter scheduler state from `/proc/<pid>/stat`, if procfs has one.
pub fn proc_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_state(&stat)
}

/// The comm field may itself contain `)` or spaces, so the state is the first
/// token after the last `)`.
fn parse_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn non_positive_pids_are_never_alive() {
        let probe = ProcessTableProbe;
        assert!(!probe.is_alive(0));
        assert!(!probe.is_alive(-1));
        assert!(!probe.is_alive(i32::MIN));
    }

    #[test]
    fn own_process_is_alive() {
        let probe = ProcessTableProbe;
        assert!(probe.is_alive(std::process::id() as i32));
    }

    #[test]
    fn out_of_range_pid_is_not_alive() {
        assert!(!ProcessTableProbe.is_alive(i32::MAX));
    }

    #[test]
    fn reaped_child_reads_dead_immediately() {
        let probe = ProcessTableProbe;
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        assert!(probe.is_alive(pid));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!probe.is_alive(pid), "no stale answer after termination");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreaped_zombie_reads_dead() {
        let probe = ProcessTableProbe;
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        child.kill().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while proc_state(pid) != Some('Z') && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(proc_state(pid), Some('Z'));
        assert!(!probe.is_alive(pid));

        child.wait().unwrap();
    }

    #[test]
    fn stat_state_survives_odd_command_names() {
        assert_eq!(
            parse_stat_state("1234 (sleep) S 1 1234 1234 0 -1"),
            Some('S')
        );
        assert_eq!(
            parse_stat_state("77 (weird) name) Z 1 77 77 0 -1"),
            Some('Z')
        );
        assert_eq!(parse_stat_state("garbage"), None);
        assert_eq!(parse_stat_state("1 (x)"), None);
    }
}
