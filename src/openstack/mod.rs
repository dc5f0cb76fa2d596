//! OpenStack client core: REST cache, typed resources, and pollers.
//!
//! Everything here talks to the platform through [`rest::Session`], so the
//! same code runs against Keystone-authenticated HTTP sessions in
//! production and against in-memory doubles in tests.

pub mod auth;
mod error;
pub mod http;
pub mod poll;
mod queries;
pub mod rest;
pub mod types;

pub use error::{ApiFailure, OpenstackError};
pub use http::HttpSession;
pub use poll::{
    AssignFloatingIp, AttachVolume, CreateServer, DeleteServer, DeleteVolume, PollSettings,
    PollerKind, PollingAction, VolumeState,
};
pub use rest::{ApiExchange, Method, RawResponse, RequestCache, Service, Session, SessionMap};
pub use types::{AddressKind, Server, ServerId, VolumeId};
