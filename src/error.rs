//! Failure taxonomy shared by every supervisor component.
//!
//! Each variant is also the tag written into audit lines (`[TimedOut] ...`),
//! so a post-hoc reader can grep the log for a class of failure.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// Elevated credentials were refused or the elevated command failed.
    Denied,
    /// A required external program is missing, or elevation is disabled.
    Unavailable,
    /// A bounded wait ran out.
    TimedOut,
    /// The pid file, log file or lock file could not be read or written.
    #[serde(rename = "IOFailure")]
    IoFailure,
    /// A spawned worker never showed up in the process table.
    NotDiscoverable,
    /// The recorded pid belongs to a process that is plausibly not the worker.
    ///
    /// Never produced by the probe: pid reuse is accepted, not detected.
    StaleIdentity,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Denied => "Denied",
            FailureKind::Unavailable => "Unavailable",
            FailureKind::TimedOut => "TimedOut",
            FailureKind::IoFailure => "IOFailure",
            FailureKind::NotDiscoverable => "NotDiscoverable",
            FailureKind::StaleIdentity => "StaleIdentity",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a failure the way it appears in the audit log.
pub fn tagged(kind: FailureKind, message: impl fmt::Display) -> String {
    format!("[{kind}] {message}")
}
