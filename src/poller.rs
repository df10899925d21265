//! Fixed-interval status polling for observers.
//!
//! The poller only ever calls query operations on the facade. Stopping it
//! just ends the loop; there is never in-flight work to abort.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::supervisor::{StatusSnapshot, SupervisorFacade};

/// Upper bound on how long a stop request waits for the loop to notice.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Poll `facade` every `interval` until `stop` is set, handing each snapshot
/// to `on_tick`. The first poll happens immediately.
pub fn run_poll_loop<F>(
    facade: &SupervisorFacade,
    interval: Duration,
    stop: &AtomicBool,
    mut on_tick: F,
) where
    F: FnMut(&StatusSnapshot),
{
    while !stop.load(Ordering::Relaxed) {
        let snapshot = facade.snapshot();
        debug!(state = %snapshot.state, pid = ?snapshot.pid, "status poll");
        on_tick(&snapshot);
        sleep_unless_stopped(interval, stop);
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
    }
}

/// [`run_poll_loop`] on a background thread.
pub struct StatusPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn spawn<F>(facade: Arc<SupervisorFacade>, interval: Duration, on_tick: F) -> io::Result<Self>
    where
        F: FnMut(&StatusSnapshot) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("status-poller".to_string())
            .spawn(move || run_poll_loop(&facade, interval, &flag, on_tick))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
