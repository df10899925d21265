//! Single-flight lock for mutating supervisor operations.
//!
//! Threads in one process queue on a mutex; supervisor processes queue on an
//! exclusive `flock` of a sidecar file next to the pid file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

pub(crate) struct MutationLock {
    inner: Mutex<()>,
}

/// Held for the whole mutating operation; releases both layers on drop.
pub(crate) struct MutationGuard<'a> {
    _file: Option<FileLock>,
    _inner: MutexGuard<'a, ()>,
}

impl MutationLock {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Block until this caller owns the mutation slot.
    ///
    /// With `create == false` a missing lock file is not created: no
    /// supervisor has ever started a worker from this state directory, so
    /// there is nothing to serialize against across processes, and the
    /// caller stays free of file writes.
    pub(crate) fn acquire(&self, lock_path: &Path, create: bool) -> io::Result<MutationGuard<'_>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let file = open_lock_file(lock_path, create)?
            .map(FileLock::exclusive)
            .transpose()?;
        debug!(path = %lock_path.display(), cross_process = file.is_some(), "mutation lock held");
        Ok(MutationGuard {
            _file: file,
            _inner: inner,
        })
    }
}

fn open_lock_file(path: &Path, create: bool) -> io::Result<Option<File>> {
    if create {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        return OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map(Some);
    }
    match OpenOptions::new().read(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

struct FileLock {
    file: File,
}

impl FileLock {
    #[cfg(unix)]
    fn exclusive(file: File) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd comes from a File we own for the duration of the call.
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    #[cfg(not(unix))]
    fn exclusive(file: File) -> io::Result<Self> {
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still open; closing it would release
            // the lock anyway.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
