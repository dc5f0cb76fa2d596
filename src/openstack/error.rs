//! Error types for the OpenStack provisioning core.

use std::time::Duration;

use thiserror::Error;

use crate::lock::{LockError, LockMode};

use super::poll::PollerKind;
use super::rest::{ApiExchange, Method};

/// Details of an API call that returned an unexpected status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiFailure {
    /// Verb of the failed call.
    pub method: Method,
    /// Service-relative path of the failed call.
    pub path: String,
    /// Status code returned by the platform.
    pub status: u16,
    /// Every exchange recorded up to and including the failure.
    pub history: Vec<ApiExchange>,
}

/// Errors raised while talking to OpenStack or orchestrating a VM.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OpenstackError {
    /// Raised for invalid caller input.
    #[error("invalid usage: {0}")]
    Usage(String),
    /// Raised when a named resource does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing resource.
        what: String,
    },
    /// Raised when a server name matches more than one server.
    #[error("found {count} servers named '{name}'")]
    Ambiguous {
        /// Server name that should be unique.
        name: String,
        /// Number of servers observed with that name.
        count: usize,
    },
    /// Raised when an existing server lacks the requested address.
    #[error("server {server} has no {kind} address on network {network}")]
    MissingAddress {
        /// Server identifier.
        server: String,
        /// Address kind requested.
        kind: String,
        /// Network that was searched.
        network: String,
    },
    /// Raised when the platform answers with an unaccepted status.
    #[error("{} {} returned status {}", .0.method, .0.path, .0.status)]
    Api(Box<ApiFailure>),
    /// Raised when a request never produced a response.
    #[error("transport error: {message}")]
    Transport {
        /// Message from the HTTP client.
        message: String,
    },
    /// Raised when a response lacks an expected key or structure.
    #[error("unexpected response shape: {message}")]
    Shape {
        /// Description of the mismatch.
        message: String,
    },
    /// Raised when an operation requires state that is not present yet.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Raised when a poller exceeds its deadline.
    #[error("timed out after {}s waiting for {action}", .timeout.as_secs())]
    Timeout {
        /// Poller that gave up.
        action: PollerKind,
        /// Deadline that was exceeded.
        timeout: Duration,
    },
    /// Raised when a bounded lock wait expires.
    #[error("timed out waiting for {mode} lock on {path}")]
    LockTimeout {
        /// Lock file path.
        path: String,
        /// Mode that was requested.
        mode: LockMode,
    },
    /// Raised when the lock primitive itself fails.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Raised when credentials or the service catalogue are unusable.
    #[error("authentication failed: {message}")]
    Auth {
        /// Description of the failure.
        message: String,
    },
    /// Raised when a local file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path being read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

impl OpenstackError {
    /// Builds a [`Self::NotFound`] for `what`.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Whether a poller should absorb the error and try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Api(_) | Self::Transport { .. })
    }

    /// Whether the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Status code of an API failure, if this is one.
    #[must_use]
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Self::Api(failure) => Some(failure.status),
            _ => None,
        }
    }

    /// Process exit code reported for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::NotFound { .. } => 3,
            Self::Ambiguous { .. } => 4,
            Self::Timeout { .. } => 5,
            Self::LockTimeout { .. } => 6,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn api_failure(status: u16) -> OpenstackError {
        OpenstackError::Api(Box::new(ApiFailure {
            method: Method::Get,
            path: String::from("/servers/abc"),
            status,
            history: Vec::new(),
        }))
    }

    #[rstest]
    #[case(api_failure(500), true)]
    #[case(OpenstackError::Transport { message: String::from("reset") }, true)]
    #[case(OpenstackError::Ambiguous { name: String::from("web"), count: 2 }, false)]
    #[case(OpenstackError::Shape { message: String::from("no key") }, false)]
    fn retryable_kinds(#[case] err: OpenstackError, #[case] expected: bool) {
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn api_failure_message_names_call() {
        assert_eq!(api_failure(404).to_string(), "GET /servers/abc returned status 404");
    }

    #[rstest]
    #[case(OpenstackError::Usage(String::from("x")), 2)]
    #[case(OpenstackError::not_found("server web"), 3)]
    #[case(OpenstackError::Ambiguous { name: String::from("web"), count: 3 }, 4)]
    #[case(OpenstackError::Timeout { action: PollerKind::CreateServer, timeout: Duration::from_secs(5) }, 5)]
    #[case(api_failure(409), 1)]
    fn exit_codes(#[case] err: OpenstackError, #[case] code: u8) {
        assert_eq!(err.exit_code(), code);
    }
}
