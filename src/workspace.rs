//! Per-job workspace: lock files, state directory, and API dumps.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info};

use crate::lock::{LockError, LockMode, ProcessLock};
use crate::openstack::RequestCache;

/// Prefix of the lock guarding workspace bootstrap.
pub const WORKSPACE_LOCK_PREFIX: &str = ".adept_job_workspace";
/// Prefix of the host-wide lock guarding floating address assignment.
pub const ADDRESS_LOCK_PREFIX: &str = ".adept_global_floatingip";
/// Directory holding persisted state inside the workspace.
pub const STATE_DIR_NAME: &str = ".adept_openstack";
/// Suffix of API dump files.
pub const API_DUMP_SUFFIX: &str = "_api_responses.json";

/// Errors raised while preparing or writing workspace state.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WorkspaceError {
    /// Raised when the workspace directory does not exist.
    #[error("workspace {path} is not an existing directory")]
    Missing {
        /// Path supplied by the caller.
        path: String,
    },
    /// Raised when a lock cannot be created or taken.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Raised when a bounded lock wait expires.
    #[error("timed out waiting for {mode} lock on {path}")]
    LockTimeout {
        /// Lock file path.
        path: String,
        /// Requested mode.
        mode: LockMode,
    },
    /// Raised when state cannot be written.
    #[error("failed to write {path}: {message}")]
    Write {
        /// Target path.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Writable directory owned by one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Workspace {
    root: Utf8PathBuf,
}

impl Workspace {
    /// Wraps an existing directory.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Missing`] when `path` is not a directory.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self, WorkspaceError> {
        let root = path.into();
        if !root.is_dir() {
            return Err(WorkspaceError::Missing {
                path: root.to_string(),
            });
        }
        Ok(Self { root })
    }

    /// Workspace directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding persisted state.
    #[must_use]
    pub fn state_dir(&self) -> Utf8PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    /// Lock guarding workspace bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Lock`] when the lock file cannot be created.
    pub fn workspace_lock(&self) -> Result<ProcessLock, WorkspaceError> {
        Ok(ProcessLock::in_dir(&self.root, WORKSPACE_LOCK_PREFIX)?)
    }

    /// Lock guarding floating address assignment, in `lock_dir` when given.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Lock`] when the lock file cannot be created.
    pub fn address_lock(&self, lock_dir: Option<&Utf8Path>) -> Result<ProcessLock, WorkspaceError> {
        let dir = lock_dir.unwrap_or(&self.root);
        Ok(ProcessLock::in_dir(dir, ADDRESS_LOCK_PREFIX)?)
    }

    /// Creates the state directory once, under the workspace lock.
    ///
    /// Creation happens under the exclusive side; concurrent jobs then
    /// confirm the directory under the shared side.
    ///
    /// # Errors
    ///
    /// - [`WorkspaceError::LockTimeout`] when either wait expires.
    /// - [`WorkspaceError::Write`] when the directory cannot be created.
    pub async fn prepare(&self, lock: &ProcessLock, timeout: Duration) -> Result<Utf8PathBuf, WorkspaceError> {
        let state_dir = self.state_dir();
        {
            let _exclusive = lock
                .acquire_exclusive_within(timeout)
                .await?
                .ok_or_else(|| lock_timeout(lock, LockMode::Exclusive))?;
            if state_dir.is_dir() {
                debug!(path = %state_dir, "state directory already present");
            } else {
                let root = self.open_root()?;
                root.create_dir_all(STATE_DIR_NAME)
                    .map_err(|err| write_error(&state_dir, &err))?;
                info!(path = %state_dir, "created state directory");
            }
        }

        let _shared = lock
            .acquire_shared_within(timeout)
            .await?
            .ok_or_else(|| lock_timeout(lock, LockMode::Shared))?;
        if !state_dir.is_dir() {
            return Err(WorkspaceError::Write {
                path: state_dir.to_string(),
                message: String::from("state directory vanished after creation"),
            });
        }
        Ok(state_dir)
    }

    /// Path of the API dump for `operation`.
    #[must_use]
    pub fn api_dump_path(&self, operation: &str) -> Utf8PathBuf {
        self.state_dir().join(format!("{operation}{API_DUMP_SUFFIX}"))
    }

    /// Writes the request history of `rest` as the API dump for `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Write`] when the file cannot be written.
    pub fn write_api_dump(&self, operation: &str, rest: &RequestCache) -> Result<Utf8PathBuf, WorkspaceError> {
        let path = self.api_dump_path(operation);
        let rendered = serde_json::to_string_pretty(&rest.dump()).map_err(|err| WorkspaceError::Write {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let root = self.open_root()?;
        root.create_dir_all(STATE_DIR_NAME)
            .map_err(|err| write_error(&path, &err))?;
        root.write(Utf8Path::new(STATE_DIR_NAME).join(format!("{operation}{API_DUMP_SUFFIX}")), rendered)
            .map_err(|err| write_error(&path, &err))?;
        info!(path = %path, exchanges = rest.exchange_count(), "wrote API dump");
        Ok(path)
    }

    fn open_root(&self) -> Result<Dir, WorkspaceError> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| write_error(&self.root, &err))
    }
}

fn lock_timeout(lock: &ProcessLock, mode: LockMode) -> WorkspaceError {
    WorkspaceError::LockTimeout {
        path: lock.path().to_string(),
        mode,
    }
}

fn write_error(path: &Utf8Path, err: &std::io::Error) -> WorkspaceError {
    WorkspaceError::Write {
        path: path.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCloud;
    use tempfile::TempDir;

    fn workspace(dir: &TempDir) -> Workspace {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp path: {}", path.display()));
        Workspace::new(root).unwrap_or_else(|err| panic!("workspace should open: {err}"))
    }

    #[test]
    fn missing_directory_is_rejected() {
        let err = Workspace::new("/nonexistent/adept/workspace").expect_err("directory is missing");
        assert!(matches!(err, WorkspaceError::Missing { .. }));
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let workspace = workspace(&dir);
        let lock = workspace
            .workspace_lock()
            .unwrap_or_else(|err| panic!("lock should open: {err}"));

        for _ in 0..2 {
            let state = workspace
                .prepare(&lock, Duration::from_secs(1))
                .await
                .unwrap_or_else(|err| panic!("prepare should succeed: {err}"));
            assert!(state.is_dir());
        }
        assert!(workspace.root().join(".adept_job_workspace.lock").is_file());
    }

    #[test]
    fn address_lock_honours_lock_dir() {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let other = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let workspace = workspace(&dir);
        let lock_dir = Utf8Path::from_path(other.path()).unwrap_or_else(|| panic!("UTF-8 path"));

        let lock = workspace
            .address_lock(Some(lock_dir))
            .unwrap_or_else(|err| panic!("lock should open: {err}"));

        assert_eq!(
            lock.path(),
            lock_dir.join(".adept_global_floatingip.lock").as_path()
        );
    }

    #[tokio::test]
    async fn api_dump_records_sequence_numbers() {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let workspace = workspace(&dir);
        let cloud = FakeCloud::new();
        let mut rest = cloud.request_cache();
        rest.server_list("name")
            .await
            .unwrap_or_else(|err| panic!("listing should succeed: {err}"));
        rest.volume_list()
            .await
            .unwrap_or_else(|err| panic!("listing should succeed: {err}"));

        let path = workspace
            .write_api_dump("destroy", &rest)
            .unwrap_or_else(|err| panic!("dump should be written: {err}"));

        let content = std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read dump: {err}"));
        let dump: serde_json::Value =
            serde_json::from_str(&content).unwrap_or_else(|err| panic!("dump is JSON: {err}"));
        assert!(path.as_str().ends_with(".adept_openstack/destroy_api_responses.json"));
        assert_eq!(dump.pointer("/0/sequence_number"), Some(&serde_json::json!(0)));
        assert_eq!(dump.pointer("/1/sequence_number"), Some(&serde_json::json!(10)));
        assert_eq!(dump.pointer("/1/status_code"), Some(&serde_json::json!(200)));
        assert!(dump.pointer("/0/GET").is_some());
    }
}
