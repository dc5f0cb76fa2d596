//! Create a volume next to a server and wait until it is attached.

use std::time::Duration;

use tracing::{debug, info};

use crate::openstack::rest::RequestCache;
use crate::openstack::types::{ServerId, VolumeId};
use crate::openstack::OpenstackError;

use super::{PollSettings, PollerKind, PollingAction};

/// Poller for a created volume that must end up attached.
#[derive(Clone, Debug)]
pub struct AttachVolume {
    server_id: ServerId,
    volume_id: VolumeId,
    attach_requested: bool,
}

impl AttachVolume {
    /// Creates a `size_gb` volume named after the server and scheduled on
    /// the same host.
    ///
    /// # Errors
    ///
    /// Propagates failures of the create call.
    pub async fn submit(
        rest: &mut RequestCache,
        server_name: &str,
        server_id: &ServerId,
        size_gb: u32,
    ) -> Result<Self, OpenstackError> {
        let description = format!("Scratch storage for {server_name}");
        let volume_id = rest.create_volume(server_id, size_gb, &description).await?;
        info!(server = %server_id, volume = %volume_id, size_gb, "volume create submitted");
        Ok(Self {
            server_id: server_id.clone(),
            volume_id,
            attach_requested: false,
        })
    }

    /// Id of the created volume.
    #[must_use]
    pub const fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }

    /// Waits until the volume is attached and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Timeout`] when attachment never completes.
    pub async fn wait(
        mut self,
        rest: &mut RequestCache,
        settings: PollSettings,
    ) -> Result<VolumeId, OpenstackError> {
        let mut driver = PollingAction::new(PollerKind::AttachVolume, settings);
        driver.run(async |_: Duration| self.check(rest).await).await
    }

    async fn check(&mut self, rest: &mut RequestCache) -> Result<Option<VolumeId>, OpenstackError> {
        let volume = rest.volume(&self.volume_id).await?;
        let server = rest.server(&self.server_id).await?;
        let attached = server
            .volumes_attached
            .iter()
            .any(|entry| entry.id == self.volume_id);
        debug!(volume = %self.volume_id, status = volume.status, attached, "volume status");

        if attached {
            return Ok(Some(self.volume_id.clone()));
        }
        if !self.attach_requested && volume.status == "available" {
            rest.attach_volume(&self.server_id, &self.volume_id).await?;
            self.attach_requested = true;
            info!(server = %self.server_id, volume = %self.volume_id, "volume attach submitted");
        }
        Ok(None)
    }
}
