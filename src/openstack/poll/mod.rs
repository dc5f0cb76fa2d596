//! Deadline-bounded polling of asynchronous platform operations.
//!
//! Every platform mutation in this crate follows the same shape: issue the
//! request once, then repeatedly evaluate a completion check until it yields
//! a value or the deadline passes. [`PollingAction`] is that loop; the
//! concrete pollers in the submodules supply the mutation and the check.

mod assign_floating_ip;
mod attach_volume;
mod create_server;
mod delete_server;
mod delete_volume;

use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::OpenstackError;

pub use assign_floating_ip::AssignFloatingIp;
pub use attach_volume::AttachVolume;
pub use create_server::CreateServer;
pub use delete_server::DeleteServer;
pub use delete_volume::{DeleteVolume, VolumeState};

/// Default overall deadline for one poller.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Default pause between completion checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// Pause between checks for server create and delete.
pub const SERVER_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on the deadline for volume attach and address assignment.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(120);

/// The closed set of pollers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PollerKind {
    /// Boot a server and wait until it runs.
    CreateServer,
    /// Delete a server and wait until it leaves the listing.
    DeleteServer,
    /// Create a volume and wait until it is attached.
    AttachVolume,
    /// Detach and delete a volume and wait until it is gone.
    DeleteVolume,
    /// Map a floating address onto a server.
    AssignFloatingIp,
}

impl PollerKind {
    /// Human-readable name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateServer => "server creation",
            Self::DeleteServer => "server deletion",
            Self::AttachVolume => "volume attachment",
            Self::DeleteVolume => "volume deletion",
            Self::AssignFloatingIp => "floating address assignment",
        }
    }

    /// Pause between checks when none is configured.
    #[must_use]
    pub const fn default_interval(self) -> Duration {
        match self {
            Self::CreateServer | Self::DeleteServer => SERVER_INTERVAL,
            _ => DEFAULT_INTERVAL,
        }
    }

    /// Applies the per-kind cap to the configured deadline.
    #[must_use]
    pub fn bounded_timeout(self, configured: Duration) -> Duration {
        match self {
            Self::AttachVolume | Self::AssignFloatingIp => configured.min(SHORT_TIMEOUT),
            _ => configured,
        }
    }
}

impl fmt::Display for PollerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing configuration threaded into every poller of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    timeout: Duration,
    interval: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl PollSettings {
    /// Uses `timeout` as the run-wide deadline and per-kind intervals.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: None,
        }
    }

    /// Overrides the pause between checks for every kind.
    ///
    /// This is primarily used by tests to keep scenarios short.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Run-wide deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Observable phase of a [`PollingAction`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollState {
    /// The deadline has not been fixed yet.
    Pending,
    /// Checks are running against a fixed deadline.
    Polling,
}

/// Generic deadline loop shared by every poller.
#[derive(Clone, Debug)]
pub struct PollingAction {
    kind: PollerKind,
    timeout: Duration,
    interval: Duration,
    deadline: Option<Instant>,
    attempts: u32,
}

impl PollingAction {
    /// Prepares a loop for `kind` using `settings`.
    #[must_use]
    pub fn new(kind: PollerKind, settings: PollSettings) -> Self {
        Self {
            kind,
            timeout: kind.bounded_timeout(settings.timeout),
            interval: settings.interval.unwrap_or_else(|| kind.default_interval()),
            deadline: None,
            attempts: 0,
        }
    }

    /// Which poller this loop drives.
    #[must_use]
    pub const fn kind(&self) -> PollerKind {
        self.kind
    }

    /// Effective deadline length after per-kind capping.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of completion checks evaluated so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> PollState {
        if self.deadline.is_some() {
            PollState::Polling
        } else {
            PollState::Pending
        }
    }

    /// Time left before the deadline; the full timeout before the first run.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.map_or(self.timeout, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    /// Runs `check` until it yields a value or the deadline passes.
    ///
    /// The deadline is fixed on the first call. Each round checks the
    /// deadline, sleeps one interval, then evaluates `check` with the time
    /// remaining. Retryable errors count as "not done yet"; any other error
    /// ends the loop immediately.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Timeout`] once the deadline passes, or the
    /// first non-retryable error from `check`.
    pub async fn run<T, F>(&mut self, mut check: F) -> Result<T, OpenstackError>
    where
        F: AsyncFnMut(Duration) -> Result<Option<T>, OpenstackError>,
    {
        let timeout = self.timeout;
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now() + timeout);

        loop {
            if Instant::now() >= deadline {
                warn!(action = %self.kind, attempts = self.attempts, "poller timed out");
                return Err(OpenstackError::Timeout {
                    action: self.kind,
                    timeout: self.timeout,
                });
            }
            sleep(self.interval).await;
            self.attempts += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            match check(remaining).await {
                Ok(Some(value)) => {
                    debug!(action = %self.kind, attempts = self.attempts, "poller finished");
                    return Ok(value);
                }
                Ok(None) => {}
                Err(err) if err.is_retryable() => {
                    debug!(action = %self.kind, error = %err, "check failed; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests;
