//! Detach and delete a volume, tolerating it vanishing at any point.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::openstack::rest::RequestCache;
use crate::openstack::types::{ServerId, VolumeId};
use crate::openstack::OpenstackError;

use super::{PollSettings, PollerKind, PollingAction};

/// What one lookup of the volume found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// Present with no attachments.
    Found {
        /// Platform status at lookup time.
        status: String,
    },
    /// No longer listed.
    AlreadyGone,
    /// Present and attached to these servers.
    StillAttached(Vec<ServerId>),
}

/// Poller for a volume that must end up deleted.
#[derive(Clone, Debug)]
pub struct DeleteVolume {
    volume_id: VolumeId,
    detach_requested: BTreeSet<ServerId>,
    vanished: BTreeSet<ServerId>,
}

impl DeleteVolume {
    /// Targets `volume_id`; nothing is submitted until the first check.
    #[must_use]
    pub const fn new(volume_id: VolumeId) -> Self {
        Self {
            volume_id,
            detach_requested: BTreeSet::new(),
            vanished: BTreeSet::new(),
        }
    }

    /// Looks the volume up, distinguishing "gone" from real failures.
    ///
    /// # Errors
    ///
    /// Returns the detail-lookup failure when the volume is still listed.
    pub async fn inspect(&self, rest: &mut RequestCache) -> Result<VolumeState, OpenstackError> {
        match rest.volume(&self.volume_id).await {
            Ok(volume) => {
                let servers = volume.attached_server_ids();
                if servers.is_empty() {
                    Ok(VolumeState::Found {
                        status: volume.status,
                    })
                } else {
                    Ok(VolumeState::StillAttached(servers))
                }
            }
            Err(err) => {
                let listed = rest.volume_list().await?;
                if listed.contains(&self.volume_id) {
                    Err(err)
                } else {
                    Ok(VolumeState::AlreadyGone)
                }
            }
        }
    }

    /// Waits until the volume is gone and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Timeout`] when the volume lingers.
    pub async fn wait(
        mut self,
        rest: &mut RequestCache,
        settings: PollSettings,
    ) -> Result<VolumeId, OpenstackError> {
        let mut driver = PollingAction::new(PollerKind::DeleteVolume, settings);
        driver.run(async |_: Duration| self.check(rest).await).await
    }

    async fn check(&mut self, rest: &mut RequestCache) -> Result<Option<VolumeId>, OpenstackError> {
        match self.inspect(rest).await? {
            VolumeState::AlreadyGone => {
                info!(volume = %self.volume_id, "volume deleted");
                Ok(Some(self.volume_id.clone()))
            }
            VolumeState::StillAttached(servers) => {
                let live: Vec<ServerId> = servers
                    .into_iter()
                    .filter(|server| !self.vanished.contains(server))
                    .collect();
                if live.is_empty() {
                    debug!(volume = %self.volume_id, "only stale attachments remain");
                    self.submit_delete(rest).await;
                    return Ok(None);
                }
                for server in live {
                    if self.detach_requested.contains(&server) {
                        continue;
                    }
                    match rest.detach_volume(&server, &self.volume_id).await {
                        Err(err) if err.api_status() == Some(404) => {
                            info!(volume = %self.volume_id, server = %server, "attached server no longer exists");
                            self.vanished.insert(server);
                        }
                        Err(err) => {
                            warn!(volume = %self.volume_id, server = %server, error = %err, "detach request failed");
                            self.detach_requested.insert(server);
                        }
                        Ok(_) => {
                            self.detach_requested.insert(server);
                        }
                    }
                }
                Ok(None)
            }
            VolumeState::Found { status } if status == "deleting" => {
                debug!(volume = %self.volume_id, "volume delete in progress");
                Ok(None)
            }
            VolumeState::Found { .. } => {
                self.submit_delete(rest).await;
                Ok(None)
            }
        }
    }

    async fn submit_delete(&self, rest: &mut RequestCache) {
        if let Err(err) = rest.delete_volume(&self.volume_id).await {
            warn!(volume = %self.volume_id, error = %err, "volume delete request failed");
        }
    }
}
