use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::launcher::{ENV_AUDIT_LOG, ENV_CONFIG, ENV_EVENT_DB, ENV_SENSOR};

#[derive(Parser, Debug)]
#[command(
    name = "screenlogger",
    about = "Supervise a detached, eviction-hardened screen logging worker",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the worker unless one is already running
    Start,

    /// Terminate the tracked worker
    Stop,

    /// Show whether the tracked worker is alive
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the live worker pid, or -1 when none
    Pid,

    /// Print the current sensor reading, or -1 when unavailable
    Sensor,

    /// Start the worker if needed; meant for boot and periodic triggers
    Ensure,

    /// Print or clear the audit log
    Log {
        /// Truncate the log instead of printing it
        #[arg(long)]
        clear: bool,
    },

    /// Poll status on a fixed interval until interrupted
    Watch {
        /// Seconds between polls (defaults to [poller] interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List stored screen on/off events
    Events {
        /// Show the latest N events, oldest first
        #[arg(long, conflicts_with = "recent_hours")]
        last: Option<usize>,

        /// Show events from the last H hours, newest first
        #[arg(long)]
        recent_hours: Option<u64>,
    },

    /// Show project configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },

    /// Worker entry point, spawned by `start`
    #[command(hide = true)]
    Worker {
        #[arg(long, env = ENV_SENSOR)]
        sensor: Option<PathBuf>,

        #[arg(long, env = ENV_EVENT_DB)]
        event_db: Option<PathBuf>,

        #[arg(long, env = ENV_AUDIT_LOG)]
        audit_log: Option<PathBuf>,

        /// Config file to load instead of searching from the working directory
        #[arg(long, env = ENV_CONFIG)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
