//! Delete a server and wait until it leaves the listing.

use std::time::Duration;

use tracing::info;

use crate::openstack::rest::RequestCache;
use crate::openstack::types::ServerId;
use crate::openstack::OpenstackError;

use super::{PollSettings, PollerKind, PollingAction};

/// Poller for a submitted server deletion.
#[derive(Clone, Debug)]
pub struct DeleteServer {
    server_id: ServerId,
}

impl DeleteServer {
    /// Submits the delete. A rejected request is only logged.
    ///
    /// # Errors
    ///
    /// Propagates failures of the follow-up listing.
    pub async fn submit(rest: &mut RequestCache, server_id: &ServerId) -> Result<Self, OpenstackError> {
        let remaining = rest.server_delete(server_id).await?;
        info!(server = %server_id, listed = remaining.len(), "server delete submitted");
        Ok(Self {
            server_id: server_id.clone(),
        })
    }

    /// Waits until the id is absent and returns the ids still listed.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Timeout`] when the server lingers.
    pub async fn wait(
        self,
        rest: &mut RequestCache,
        settings: PollSettings,
    ) -> Result<Vec<String>, OpenstackError> {
        let mut driver = PollingAction::new(PollerKind::DeleteServer, settings);
        driver.run(async |_: Duration| self.check(rest).await).await
    }

    async fn check(&self, rest: &mut RequestCache) -> Result<Option<Vec<String>>, OpenstackError> {
        let listed = rest.server_list("id").await?;
        if listed.iter().any(|id| id.as_str() == self.server_id.as_str()) {
            return Ok(None);
        }
        Ok(Some(listed))
    }
}
