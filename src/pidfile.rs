//! Durable record of the worker's last-known pid.
//!
//! The pid file is the only channel between the supervisor, the worker and
//! any later supervisor process. It holds a single decimal pid, last writer
//! wins. Writes go to a sibling temp file that is renamed over the record, so
//! a reader sees either the previous complete value or the new one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(1);

/// What a read of the pid file found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidRecord {
    Present(i32),
    Absent,
    /// File exists but does not hold a positive integer. Carries the raw text.
    Corrupt(String),
}

impl PidRecord {
    /// The recorded pid. `Absent` and `Corrupt` both mean "no known pid".
    pub fn pid(&self) -> Option<i32> {
        match self {
            PidRecord::Present(pid) => Some(*pid),
            PidRecord::Absent | PidRecord::Corrupt(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("refusing to record non-positive pid {0}")]
    InvalidPid(i32),
    #[error("failed to write pid file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read pid file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parse pid file contents. Surrounding whitespace is ignored; the rest must
/// be plain ASCII digits naming a positive pid.
pub fn parse_pid(raw: &str) -> Option<i32> {
    let digits = raw.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<i32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct PidFileStore {
    path: PathBuf,
}

impl PidFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the record with `pid`.
    pub fn write(&self, pid: i32) -> Result<(), PidFileError> {
        if pid <= 0 {
            return Err(PidFileError::InvalidPid(pid));
        }
        let wrap = |source| PidFileError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(wrap)?;
        }

        let tmp = self.temp_path();
        let result = write_synced(&tmp, format!("{pid}\n").as_bytes())
            .and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(wrap(e));
        }

        debug!(pid, path = %self.path.display(), "pid record written");
        Ok(())
    }

    pub fn read(&self) -> Result<PidRecord, PidFileError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(match std::str::from_utf8(&bytes).ok().and_then(parse_pid) {
                Some(pid) => PidRecord::Present(pid),
                None => {
                    let raw = String::from_utf8_lossy(&bytes).into_owned();
                    debug!(path = %self.path.display(), raw = %raw.trim(), "pid record is corrupt");
                    PidRecord::Corrupt(raw)
                }
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PidRecord::Absent),
            Err(source) => Err(PidFileError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pid".to_string());
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{name}.tmp.{}.{seq}", std::process::id()))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
