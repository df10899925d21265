//! Append-only audit log shared by the supervisor and the worker.
//!
//! One entry per line, `[yyyy-MM-dd HH:mm:ss] message`. Each append opens the
//! file in append mode and issues a single write, so lines from different
//! processes interleave whole.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::{debug, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(&Local::now())
}

/// A parsed audit line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: String,
    pub message: String,
}

impl AuditEntry {
    /// Parse a single log line. Lines that don't carry a valid bracketed
    /// timestamp yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let (timestamp, message) = rest.split_once("] ")?;
        NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            timestamp: timestamp.to_string(),
            message: message.to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry stamped with the current local time.
    pub fn append(&self, message: &str) -> Result<()> {
        let entry = AuditEntry {
            timestamp: now_timestamp(),
            message: message.replace('\n', " "),
        };
        debug!(message = %entry.message, "audit");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log: {}", self.path.display()))?;
        file.write_all(format!("{}\n", entry.render()).as_bytes())
            .context("failed to write audit entry")?;
        Ok(())
    }

    /// Append, downgrading failure to a warning. Audit trouble must never
    /// change the outcome of a control operation.
    pub fn record(&self, message: &str) {
        if let Err(e) = self.append(message) {
            warn!(error = %e, message, "audit log append failed");
        }
    }

    /// Full log contents; empty when the file does not exist yet.
    pub fn read_all(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read audit log: {}", self.path.display())),
        }
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .lines()
            .filter_map(AuditEntry::parse_line)
            .collect())
    }

    /// Truncate the log to empty.
    pub fn clear(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }
        fs::write(&self.path, b"")
            .with_context(|| format!("failed to clear audit log: {}", self.path.display()))
    }
}
