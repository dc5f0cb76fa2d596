//! Cross-process reader/writer lock bound to a file path.
//!
//! [`ProcessLock`] wraps `flock(2)`: any number of shared holders, or one
//! exclusive holder, across every process on the host. Acquisitions hand
//! out a [`LockGuard`] that releases on drop. Within one instance the lock
//! is re-entrant: a request already covered by the held mode is granted
//! immediately and its guard leaves the outer hold untouched. Upgrading a
//! shared hold to exclusive is refused rather than risk a self-deadlock.
//!
//! Bounded waits poll with a randomised backoff; shared waiters back off
//! for less time than exclusive ones, which nudges readers ahead of a
//! waiting writer without guaranteeing it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Extension appended to lock file prefixes.
pub const LOCKFILE_SUFFIX: &str = ".lock";

const BACKOFF_FLOOR: Duration = Duration::from_millis(10);
const SHARED_JITTER_MS: u64 = 50;
const EXCLUSIVE_JITTER_MS: u64 = 100;

/// Hold state of a lock.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LockMode {
    /// Not held.
    #[default]
    Unlocked,
    /// Held alongside other readers.
    Shared,
    /// Held alone.
    Exclusive,
}

impl LockMode {
    const fn covers(self, requested: Self) -> bool {
        matches!(
            (self, requested),
            (Self::Exclusive, _) | (Self::Shared, Self::Shared | Self::Unlocked)
        )
    }

    const fn operation(self) -> libc::c_int {
        match self {
            Self::Unlocked => libc::LOCK_UN,
            Self::Shared => libc::LOCK_SH,
            Self::Exclusive => libc::LOCK_EX,
        }
    }

    const fn jitter_ms(self) -> u64 {
        match self {
            Self::Exclusive => EXCLUSIVE_JITTER_MS,
            _ => SHARED_JITTER_MS,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unlocked => "unlocked",
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        })
    }
}

/// Errors raised by the lock primitive.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LockError {
    /// Raised when the lock file cannot be opened or created.
    #[error("failed to open lock file {path}: {message}")]
    Open {
        /// Lock file path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when `flock` fails for a reason other than contention.
    #[error("flock on {path} failed: {message}")]
    Flock {
        /// Lock file path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when exclusive access is requested while holding shared.
    #[error("cannot upgrade the shared lock on {path} to exclusive")]
    Upgrade {
        /// Lock file path.
        path: String,
    },
    /// Raised when the blocking acquisition task is lost.
    #[error("lock acquisition task failed: {0}")]
    Join(String),
}

#[derive(Debug, Default)]
struct Held {
    mode: LockMode,
    file: Option<File>,
}

/// Reader/writer lock shared by every process using the same path.
#[derive(Debug)]
pub struct ProcessLock {
    path: Utf8PathBuf,
    held: Mutex<Held>,
}

/// Scoped hold on a [`ProcessLock`]; released when dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a ProcessLock,
    mode: LockMode,
    outermost: bool,
    acquired_at: Instant,
}

impl LockGuard<'_> {
    /// Mode granted to this guard.
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether dropping this guard releases the lock.
    pub const fn is_outermost(&self) -> bool {
        self.outermost
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.outermost {
            self.lock.release();
            debug!(
                path = %self.lock.path,
                mode = %self.mode,
                held_ms = self.acquired_at.elapsed().as_millis(),
                "released lock"
            );
        }
    }
}

impl ProcessLock {
    /// Binds a lock to `path`, creating the file when missing.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Open`] when the file cannot be created.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self, LockError> {
        let lock = Self {
            path: path.into(),
            held: Mutex::new(Held::default()),
        };
        drop(lock.open()?);
        debug!(path = %lock.path, "prepared lock file");
        Ok(lock)
    }

    /// Binds a lock to `<dir>/<prefix>.lock`.
    ///
    /// # Errors
    ///
    /// As for [`Self::new`].
    pub fn in_dir(dir: &Utf8Path, prefix: &str) -> Result<Self, LockError> {
        Self::new(dir.join(format!("{prefix}{LOCKFILE_SUFFIX}")))
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Mode currently held by this instance.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.state().mode
    }

    /// Blocks until shared access is granted.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the file or `flock` fails.
    pub async fn acquire_shared(&self) -> Result<LockGuard<'_>, LockError> {
        self.acquire(LockMode::Shared).await
    }

    /// Blocks until exclusive access is granted.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the file or `flock` fails, or
    /// [`LockError::Upgrade`] while this instance holds shared access.
    pub async fn acquire_exclusive(&self) -> Result<LockGuard<'_>, LockError> {
        self.acquire(LockMode::Exclusive).await
    }

    /// Waits at most `timeout` for shared access; `None` when it expires.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the file or `flock` fails.
    pub async fn acquire_shared_within(
        &self,
        timeout: Duration,
    ) -> Result<Option<LockGuard<'_>>, LockError> {
        self.acquire_within(LockMode::Shared, timeout).await
    }

    /// Waits at most `timeout` for exclusive access; `None` when it expires.
    ///
    /// # Errors
    ///
    /// As for [`Self::acquire_exclusive`].
    pub async fn acquire_exclusive_within(
        &self,
        timeout: Duration,
    ) -> Result<Option<LockGuard<'_>>, LockError> {
        self.acquire_within(LockMode::Exclusive, timeout).await
    }

    /// Whether exclusive access is available to this instance right now.
    ///
    /// True when this instance already holds it exclusively, or when nobody
    /// holds it at all. A trial lock is released before returning.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the file or `flock` fails.
    pub fn try_acquire_exclusive(&self) -> Result<bool, LockError> {
        match self.mode() {
            LockMode::Exclusive => return Ok(true),
            LockMode::Shared => return Ok(false),
            LockMode::Unlocked => {}
        }
        let trial = self.open()?;
        let granted = try_flock(&trial, LockMode::Exclusive).map_err(|err| self.flock_error(&err))?;
        if granted {
            flock(&trial, libc::LOCK_UN).map_err(|err| self.flock_error(&err))?;
        }
        Ok(granted)
    }

    /// Whether anyone, this instance included, holds the lock.
    ///
    /// # Errors
    ///
    /// As for [`Self::try_acquire_exclusive`].
    pub fn is_locked(&self) -> Result<bool, LockError> {
        if self.mode() != LockMode::Unlocked {
            return Ok(true);
        }
        self.try_acquire_exclusive().map(|free| !free)
    }

    async fn acquire(&self, mode: LockMode) -> Result<LockGuard<'_>, LockError> {
        let started = Instant::now();
        if let Some(guard) = self.nested(mode)? {
            return Ok(guard);
        }
        let file = self.open()?;
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || {
            flock(&file, mode.operation())
                .map(|()| file)
                .map_err(|err| LockError::Flock {
                    path: path.to_string(),
                    message: err.to_string(),
                })
        })
        .await
        .map_err(|err| LockError::Join(err.to_string()))??;
        Ok(self.install(file, mode, started))
    }

    async fn acquire_within(
        &self,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Option<LockGuard<'_>>, LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        if let Some(guard) = self.nested(mode)? {
            return Ok(Some(guard));
        }
        let file = self.open()?;
        loop {
            if try_flock(&file, mode).map_err(|err| self.flock_error(&err))? {
                return Ok(Some(self.install(file, mode, started)));
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(path = %self.path, %mode, timeout_ms = timeout.as_millis(), "timed out waiting for lock");
                return Ok(None);
            }
            let jitter = rand::thread_rng().gen_range(0..=mode.jitter_ms());
            let backoff = BACKOFF_FLOOR + Duration::from_millis(jitter);
            sleep(backoff.min(deadline - now)).await;
        }
    }

    fn nested(&self, requested: LockMode) -> Result<Option<LockGuard<'_>>, LockError> {
        let held = self.state().mode;
        if held == LockMode::Unlocked {
            return Ok(None);
        }
        if held.covers(requested) {
            debug!(path = %self.path, %held, %requested, "lock already held by this instance");
            return Ok(Some(LockGuard {
                lock: self,
                mode: requested,
                outermost: false,
                acquired_at: Instant::now(),
            }));
        }
        Err(LockError::Upgrade {
            path: self.path.to_string(),
        })
    }

    fn install(&self, file: File, mode: LockMode, started: Instant) -> LockGuard<'_> {
        let mut held = self.state();
        held.file = Some(file);
        held.mode = mode;
        drop(held);
        info!(path = %self.path, %mode, waited_ms = started.elapsed().as_millis(), "acquired lock");
        LockGuard {
            lock: self,
            mode,
            outermost: true,
            acquired_at: Instant::now(),
        }
    }

    fn release(&self) {
        let mut held = self.state();
        if let Some(file) = held.file.take()
            && let Err(err) = flock(&file, libc::LOCK_UN)
        {
            warn!(path = %self.path, error = %err, "failed to release lock");
        }
        held.mode = LockMode::Unlocked;
    }

    fn open(&self) -> Result<File, LockError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| LockError::Open {
                path: self.path.to_string(),
                message: err.to_string(),
            })
    }

    fn state(&self) -> MutexGuard<'_, Held> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flock_error(&self, err: &io::Error) -> LockError {
        LockError::Flock {
            path: self.path.to_string(),
            message: err.to_string(),
        }
    }
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn try_flock(file: &File, mode: LockMode) -> io::Result<bool> {
    match flock(file, mode.operation() | libc::LOCK_NB) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(err),
    }
}
