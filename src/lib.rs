//! Core library for the adept-openstack provisioning tool.
//!
//! The crate discovers, creates, and destroys one OpenStack VM per CI job.
//! Platform calls go through a cached REST layer ([`openstack::rest`]);
//! every asynchronous platform operation is driven to completion by a
//! deadline-bounded poller ([`openstack::poll`]); concurrent jobs on one
//! host coordinate floating-address assignment through [`lock::ProcessLock`].

pub mod config;
pub mod lock;
pub mod openstack;
pub mod output;
pub mod provision;
pub mod request;
pub mod test_support;
pub mod userdata;
pub mod workspace;

pub use config::{ConfigError, OpenstackConfig};
pub use lock::{LockError, LockGuard, LockMode, ProcessLock};
pub use openstack::{
    OpenstackError, PollSettings, PollerKind, PollingAction, RequestCache, ServerId, VolumeId,
};
pub use output::HostDescription;
pub use provision::{Invocation, Outcome, Provisioner};
pub use request::{CreateRequest, CreateRequestBuilder, ServerLookup};
pub use workspace::{Workspace, WorkspaceError};
