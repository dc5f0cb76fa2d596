//! Host-description document printed for configuration-management tools.

use serde::Serialize;

use crate::openstack::OpenstackError;

const REMOTE_USER: &str = "root";
const CONNECTION: &str = "ssh";

/// Connection facts for one provisioned VM.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HostDescription {
    /// Address to connect to.
    pub ansible_host: String,
    /// Same address, for older consumers.
    pub ansible_ssh_host: String,
    /// Server id.
    pub host_uuid: String,
    /// Server name.
    pub host_name: String,
    /// Login user.
    pub ansible_user: String,
    /// Login user, for older consumers.
    pub ansible_ssh_user: String,
    /// Privilege escalation is never needed as root.
    pub ansible_become: bool,
    /// Transport.
    pub ansible_connection: String,
}

impl HostDescription {
    /// Describes a VM reachable as root over SSH at `address`.
    #[must_use]
    pub fn new(address: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        let host = address.into();
        Self {
            ansible_ssh_host: host.clone(),
            ansible_host: host,
            host_uuid: id.into(),
            host_name: name.into(),
            ansible_user: REMOTE_USER.to_owned(),
            ansible_ssh_user: REMOTE_USER.to_owned(),
            ansible_become: false,
            ansible_connection: CONNECTION.to_owned(),
        }
    }

    /// Renders the document, starting with the `---` marker.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Shape`] if serialisation fails.
    pub fn render(&self) -> Result<String, OpenstackError> {
        let body = serde_yaml::to_string(self).map_err(|err| OpenstackError::Shape {
            message: format!("cannot render host description: {err}"),
        })?;
        Ok(format!("---\n{body}"))
    }
}
