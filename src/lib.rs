//! Supervisor for a detached screen logging worker.
//!
//! The worker runs as its own OS process. Everything the supervisor knows
//! about it comes from the pid file and the process table, so any number of
//! supervisor invocations can start, stop and observe the same worker.

pub mod audit;
pub mod cli;
pub mod config;
pub mod elevation;
pub mod error;
pub mod launcher;
pub mod liveness;
pub mod paths;
pub mod pidfile;
pub mod poller;
pub mod process;
pub mod sensor;
pub mod shell_completion;
pub mod store;
pub mod supervisor;
pub mod worker;
