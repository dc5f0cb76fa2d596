//! Typed views over the OpenStack resources the provisioner touches.
//!
//! Responses arrive as loose JSON; the helpers here decode the handful of
//! fields that drive decisions and leave everything else untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::OpenstackError;

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrows the identifier as a string slice.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

newtype!(
    /// Compute server identifier.
    ServerId
);
newtype!(
    /// Block-storage volume identifier.
    VolumeId
);

/// Decodes a JSON value into `T`, reporting failures as shape errors.
pub(crate) fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, OpenstackError> {
    serde_json::from_value(value).map_err(|err| OpenstackError::Shape {
        message: format!("cannot decode {what}: {err}"),
    })
}

/// Name and id pair as returned by list endpoints.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ServerSummary {
    /// Server identifier.
    pub id: ServerId,
    /// Display name; duplicates are possible.
    #[serde(default)]
    pub name: String,
}

/// Kind of address attached to a server interface.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// Address on the tenant network.
    Fixed,
    /// Publicly routable address mapped through the router.
    Floating,
    /// Anything else the platform reports.
    #[serde(other)]
    Other,
}

impl AddressKind {
    /// Returns the platform spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Floating => "floating",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One address on one network interface.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ServerAddress {
    /// Textual IP address.
    pub addr: String,
    /// Fixed or floating.
    #[serde(rename = "OS-EXT-IPS:type")]
    pub kind: AddressKind,
}

/// Reference to a volume attached to a server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AttachedVolume {
    /// Attached volume identifier.
    pub id: VolumeId,
}

/// Detailed server record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Server {
    /// Server identifier.
    pub id: ServerId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Lifecycle state (`building`, `active`, `error`, ...).
    #[serde(rename = "OS-EXT-STS:vm_state", default)]
    pub vm_state: String,
    /// Numeric hypervisor power code.
    #[serde(rename = "OS-EXT-STS:power_state", default)]
    pub power_state: Option<u8>,
    /// Addresses keyed by network name.
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
    /// Volumes currently attached.
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    pub volumes_attached: Vec<AttachedVolume>,
}

impl Server {
    /// Finds the first address of `kind` on `network`, or on the first
    /// network when none is named.
    #[must_use]
    pub fn address(&self, network: Option<&str>, kind: AddressKind) -> Option<&str> {
        let interfaces = match network {
            Some(name) => self.addresses.get(name)?,
            None => self.addresses.values().next()?,
        };
        interfaces
            .iter()
            .find(|iface| iface.kind == kind)
            .map(|iface| iface.addr.as_str())
    }

    /// Ids of the volumes attached to this server.
    #[must_use]
    pub fn attached_volume_ids(&self) -> Vec<VolumeId> {
        self.volumes_attached
            .iter()
            .map(|volume| volume.id.clone())
            .collect()
    }

    /// Decodes the reported power code. A server still being scheduled may
    /// not report one yet.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Shape`] when the code is unknown.
    pub fn power(&self) -> Result<Option<PowerState>, OpenstackError> {
        self.power_state.map(PowerState::try_from).transpose()
    }

    /// Whether the server is active and powered on.
    ///
    /// # Errors
    ///
    /// Propagates unknown power codes from [`Self::power`].
    pub fn is_running(&self) -> Result<bool, OpenstackError> {
        Ok(self.vm_state == "active" && self.power()? == Some(PowerState::Running))
    }
}

/// Hypervisor power state as mapped from the numeric code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// Code 0.
    NoState,
    /// Code 1.
    Running,
    /// Code 3.
    Paused,
    /// Code 4.
    Shutdown,
    /// Code 6.
    Crashed,
    /// Code 7.
    Suspended,
}

impl TryFrom<u8> for PowerState {
    type Error = OpenstackError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::NoState),
            1 => Ok(Self::Running),
            3 => Ok(Self::Paused),
            4 => Ok(Self::Shutdown),
            6 => Ok(Self::Crashed),
            7 => Ok(Self::Suspended),
            other => Err(OpenstackError::Shape {
                message: format!("unknown power state code {other}"),
            }),
        }
    }
}

/// Server id recorded on a volume attachment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Server the volume is attached to.
    pub server_id: ServerId,
}

/// Detailed volume record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Volume {
    /// Volume identifier.
    pub id: VolumeId,
    /// Volume name; the provisioner names volumes after their server id.
    #[serde(default)]
    pub name: Option<String>,
    /// Platform status (`creating`, `available`, `in-use`, `deleting`, ...).
    #[serde(default)]
    pub status: String,
    /// Current attachments.
    #[serde(default)]
    pub attachments: Vec<VolumeAttachment>,
}

impl Volume {
    /// Servers the volume is attached to.
    #[must_use]
    pub fn attached_server_ids(&self) -> Vec<ServerId> {
        self.attachments
            .iter()
            .map(|attachment| attachment.server_id.clone())
            .collect()
    }
}

/// Floating address as listed by the network service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FloatingIp {
    /// Textual address.
    pub floating_ip_address: String,
    /// `DOWN` when unassigned, `ACTIVE` once mapped.
    #[serde(default)]
    pub status: String,
}

impl FloatingIp {
    /// Whether the address is free for assignment.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.status == "DOWN"
    }
}

/// External gateway of a router.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct GatewayInfo {
    /// External network the router routes to.
    pub network_id: String,
}

/// Router as listed by the network service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Router {
    /// Router name; also used as the network key for server addresses.
    #[serde(default)]
    pub name: String,
    /// Gateway configuration, absent on isolated routers.
    #[serde(default)]
    pub external_gateway_info: Option<GatewayInfo>,
}
