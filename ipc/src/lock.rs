//! Serializes starting the UI server.
//!
//! Several extension instances (one per Explorer window, or one per
//! invocation of the command line tool) may find the server missing
//! at the same time.  Only the holder of the spawn lock may start
//! it, all others wait for the lock and then find the server
//! running.
//!
//! The lock is an advisory lock on a well-known file, so it is shared
//! between processes and between threads of the same process alike.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::Error;
use crate::Result;

// Controls tracing.
const TRACE: bool = false;

/// How often we look at the lock while waiting for it.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A named lock guarding the server startup.
#[derive(Debug, Clone)]
pub struct SpawnLock {
    path: PathBuf,
}

impl SpawnLock {
    /// Returns a handle for the lock backed by the file at `path`.
    ///
    /// The file is created on first use and never removed.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SpawnLock { path: path.as_ref().into() }
    }

    /// Returns the path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if ! parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        Ok(options.open(&self.path)?)
    }

    /// Acquires the lock.
    ///
    /// Makes up to `attempts` attempts, each waiting up to `wait` for
    /// the current holder to release the lock.  Returns
    /// [`Error::LockTimeout`] if the lock could not be acquired.
    pub fn acquire(&self, attempts: usize, wait: Duration)
                   -> Result<SpawnGuard>
    {
        tracer!(TRACE, "SpawnLock::acquire");
        let file = self.open()?;

        for attempt in 1..=attempts.max(1) {
            let deadline = Instant::now() + wait;
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => {
                        t!("acquired {:?} in attempt {}", self.path, attempt);
                        return Ok(SpawnGuard {
                            file: Some(file),
                            path: self.path.clone(),
                        });
                    },
                    // Somebody else holds the lock.
                    Err(e) if e.kind() == fs2::lock_contended_error().kind()
                        => (),
                    Err(e) => return Err(e.into()),
                }

                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep(POLL_INTERVAL.min(deadline - now));
            }
            log::debug!("Waiting for {:?}: attempt {} of {} timed out",
                        self.path, attempt, attempts);
        }

        Err(Error::LockTimeout(self.path.clone()).into())
    }
}

/// Holds the spawn lock.
///
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct SpawnGuard {
    file: Option<File>,
    path: PathBuf,
}

impl SpawnGuard {
    /// Releases the lock.
    ///
    /// Releasing a released lock does nothing.
    pub fn release(&mut self) {
        tracer!(TRACE, "SpawnGuard::release");
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                log::warn!("Releasing {:?}: {}", self.path, e);
            }
            t!("released {:?}", self.path);
        }
    }

    /// Returns whether the lock is still held.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    tracer!(true, "lock::tests");

    #[test]
    fn exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SpawnLock::new(dir.path().join("sub").join("spawn.lock"));

        let mut guard = lock.acquire(1, Duration::from_millis(10)).unwrap();
        assert!(guard.is_held());
        assert!(lock.path().exists());

        // A second handle on the same file is locked out.
        let e = lock.acquire(2, Duration::from_millis(20)).unwrap_err();
        assert_eq!(crate::ErrorKind::of(&e), crate::ErrorKind::Connection);
        t!("{}", e);

        guard.release();
        assert!(! guard.is_held());
        guard.release();

        let guard = lock.acquire(1, Duration::from_millis(10)).unwrap();
        drop(guard);
        lock.acquire(1, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn waits_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SpawnLock::new(dir.path().join("spawn.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let guard = lock.acquire(1, Duration::from_millis(10)).unwrap();
        let waiter = {
            let lock = lock.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                lock.acquire(10, Duration::from_millis(500)).is_ok()
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(100));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
